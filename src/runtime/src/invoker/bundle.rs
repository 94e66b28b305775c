//! OCI bundle generation.
//!
//! A bundle is a directory holding `config.json` and the container rootfs.
//! The supervisor also uses it for scratch files (pid file, `oom` marker,
//! its own log).

use std::path::{Path, PathBuf};

use kiln_core::config::CgroupManager;
use kiln_core::error::{KilnError, Result};
use oci_spec::runtime::{
    LinuxBuilder, LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, LinuxPidsBuilder,
    LinuxResourcesBuilder, Mount, MountBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder,
    UserBuilder,
};

use super::ContainerSpec;

/// File the supervisor creates in the bundle when the container was OOM killed.
pub const OOM_MARKER: &str = "oom";

const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Node-level settings that shape every bundle.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    pub cgroup_manager: CgroupManager,
    /// 0 disables the pids limit
    pub pids_limit: i64,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            cgroup_manager: CgroupManager::Cgroupfs,
            pids_limit: 0,
        }
    }
}

/// Write `config.json` for `spec` into its bundle directory.
pub fn write_bundle(spec: &ContainerSpec, options: &BundleOptions) -> Result<PathBuf> {
    std::fs::create_dir_all(&spec.bundle).map_err(|e| {
        KilnError::runtime(
            &spec.id,
            format!("failed to create bundle {}: {}", spec.bundle.display(), e),
        )
    })?;

    let oci_spec = build_spec(spec, options)?;
    let config_path = spec.bundle.join("config.json");
    let body = serde_json::to_vec_pretty(&oci_spec)?;
    std::fs::write(&config_path, body)?;

    tracing::debug!(
        container_id = %spec.id,
        bundle = %spec.bundle.display(),
        "Wrote OCI bundle"
    );
    Ok(config_path)
}

fn spec_error(id: &str, what: &str, e: impl std::fmt::Display) -> KilnError {
    KilnError::runtime(id, format!("failed to build {}: {}", what, e))
}

/// Build the runtime spec for one container.
pub(crate) fn build_spec(spec: &ContainerSpec, options: &BundleOptions) -> Result<Spec> {
    let id = spec.id.as_str();
    let (uid, gid) = spec.user.unwrap_or((0, 0));
    let user = UserBuilder::default()
        .uid(uid)
        .gid(gid)
        .build()
        .map_err(|e| spec_error(id, "user", e))?;

    let mut env = spec.env.clone();
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.insert(0, DEFAULT_PATH_ENV.to_string());
    }

    if spec.args.is_empty() {
        return Err(KilnError::runtime(id, "no command specified"));
    }

    let process = ProcessBuilder::default()
        .terminal(spec.tty)
        .user(user)
        .args(spec.args.clone())
        .env(env)
        .cwd(spec.working_dir.clone().unwrap_or_else(|| "/".to_string()))
        .no_new_privileges(true)
        .build()
        .map_err(|e| spec_error(id, "process", e))?;

    let root = RootBuilder::default()
        .path(spec.rootfs.clone())
        .readonly(spec.readonly_rootfs)
        .build()
        .map_err(|e| spec_error(id, "root", e))?;

    let mut mounts = default_mounts(id)?;
    for m in &spec.mounts {
        let mut opts = vec!["rbind".to_string()];
        opts.push(if m.readonly { "ro" } else { "rw" }.to_string());
        mounts.push(
            MountBuilder::default()
                .destination(m.container_path.clone())
                .typ("bind".to_string())
                .source(m.host_path.clone())
                .options(opts)
                .build()
                .map_err(|e| spec_error(id, "bind mount", e))?,
        );
    }

    let mut resources = LinuxResourcesBuilder::default();
    if options.pids_limit > 0 {
        let pids = LinuxPidsBuilder::default()
            .limit(options.pids_limit)
            .build()
            .map_err(|e| spec_error(id, "pids limit", e))?;
        resources = resources.pids(pids);
    }
    let resources = resources
        .build()
        .map_err(|e| spec_error(id, "resources", e))?;

    let linux = LinuxBuilder::default()
        .namespaces(namespaces(id, spec.netns.as_deref())?)
        .resources(resources)
        .cgroups_path(cgroups_path(options.cgroup_manager, &spec.sandbox_id, id))
        .masked_paths(
            [
                "/proc/acpi",
                "/proc/kcore",
                "/proc/keys",
                "/proc/latency_stats",
                "/proc/timer_list",
                "/proc/sched_debug",
                "/proc/scsi",
                "/sys/firmware",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
        )
        .readonly_paths(
            [
                "/proc/bus",
                "/proc/fs",
                "/proc/irq",
                "/proc/sys",
                "/proc/sysrq-trigger",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
        )
        .build()
        .map_err(|e| spec_error(id, "linux config", e))?;

    let mut builder = SpecBuilder::default()
        .version("1.0.2".to_string())
        .root(root)
        .process(process)
        .mounts(mounts)
        .linux(linux)
        .annotations(spec.annotations.clone());
    if let Some(hostname) = &spec.hostname {
        builder = builder.hostname(hostname.clone());
    }
    builder.build().map_err(|e| spec_error(id, "runtime spec", e))
}

/// Namespaces for a pod container. The network namespace is joined by path
/// when the pod has one and omitted for host-network pods.
fn namespaces(id: &str, netns: Option<&Path>) -> Result<Vec<LinuxNamespace>> {
    let mut namespaces = Vec::new();
    for typ in [
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
    ] {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(typ)
                .build()
                .map_err(|e| spec_error(id, "namespace", e))?,
        );
    }
    if let Some(path) = netns {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .path(path.to_path_buf())
                .build()
                .map_err(|e| spec_error(id, "network namespace", e))?,
        );
    }
    Ok(namespaces)
}

fn cgroups_path(manager: CgroupManager, sandbox_id: &str, id: &str) -> PathBuf {
    match manager {
        CgroupManager::Systemd => PathBuf::from(format!("kiln-{}.slice:kiln:{}", sandbox_id, id)),
        CgroupManager::Cgroupfs => PathBuf::from(format!("/kiln/{}/{}", sandbox_id, id)),
    }
}

fn default_mounts(id: &str) -> Result<Vec<Mount>> {
    let table: [(&str, &str, &str, &[&str]); 6] = [
        ("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
        (
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        (
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        (
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        ("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        ("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ];

    table
        .iter()
        .map(|(destination, typ, source, options)| {
            MountBuilder::default()
                .destination(destination.to_string())
                .typ(typ.to_string())
                .source(source.to_string())
                .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
                .build()
                .map_err(|e| spec_error(id, destination, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::MountSpec;
    use tempfile::TempDir;

    fn sample(bundle: &Path) -> ContainerSpec {
        ContainerSpec {
            id: "c1".to_string(),
            sandbox_id: "s1".to_string(),
            bundle: bundle.to_path_buf(),
            rootfs: bundle.join("rootfs"),
            args: vec!["sleep".to_string(), "10".to_string()],
            env: vec!["FOO=bar".to_string()],
            netns: Some(PathBuf::from("/var/run/netns/kiln-s1")),
            hostname: Some("pod1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_write_bundle_creates_config() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("c1");
        let path = write_bundle(&sample(&bundle), &BundleOptions::default()).unwrap();
        assert!(path.exists());

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["process"]["args"][0], "sleep");
        assert_eq!(value["hostname"], "pod1");
    }

    #[test]
    fn test_default_path_added() {
        let tmp = TempDir::new().unwrap();
        let spec = build_spec(&sample(tmp.path()), &BundleOptions::default()).unwrap();
        let env = spec.process().as_ref().unwrap().env().as_ref().unwrap();
        assert!(env[0].starts_with("PATH="));
        assert!(env.contains(&"FOO=bar".to_string()));
    }

    #[test]
    fn test_network_namespace_joined_by_path() {
        let tmp = TempDir::new().unwrap();
        let spec = build_spec(&sample(tmp.path()), &BundleOptions::default()).unwrap();
        let namespaces = spec.linux().as_ref().unwrap().namespaces().as_ref().unwrap();
        let net = namespaces
            .iter()
            .find(|ns| ns.typ() == LinuxNamespaceType::Network)
            .unwrap();
        assert_eq!(
            net.path().as_deref(),
            Some(Path::new("/var/run/netns/kiln-s1"))
        );
    }

    #[test]
    fn test_host_network_has_no_network_namespace() {
        let tmp = TempDir::new().unwrap();
        let mut container = sample(tmp.path());
        container.netns = None;
        let spec = build_spec(&container, &BundleOptions::default()).unwrap();
        let namespaces = spec.linux().as_ref().unwrap().namespaces().as_ref().unwrap();
        assert!(namespaces
            .iter()
            .all(|ns| ns.typ() != LinuxNamespaceType::Network));
    }

    #[test]
    fn test_bind_mounts_and_pids_limit() {
        let tmp = TempDir::new().unwrap();
        let mut container = sample(tmp.path());
        container.mounts.push(MountSpec {
            container_path: PathBuf::from("/data"),
            host_path: PathBuf::from("/srv/data"),
            readonly: true,
        });
        let options = BundleOptions {
            cgroup_manager: CgroupManager::Systemd,
            pids_limit: 512,
        };
        let spec = build_spec(&container, &options).unwrap();

        let mounts = spec.mounts().as_ref().unwrap();
        let data = mounts
            .iter()
            .find(|m| m.destination() == Path::new("/data"))
            .unwrap();
        assert!(data.options().as_ref().unwrap().contains(&"ro".to_string()));

        let linux = spec.linux().as_ref().unwrap();
        let pids = linux.resources().as_ref().unwrap().pids().as_ref().unwrap();
        assert_eq!(pids.limit(), 512);
        assert_eq!(
            linux.cgroups_path().as_deref(),
            Some(Path::new("kiln-s1.slice:kiln:c1"))
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut container = sample(tmp.path());
        container.args.clear();
        assert!(build_spec(&container, &BundleOptions::default()).is_err());
    }
}
