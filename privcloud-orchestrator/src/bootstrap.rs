//! Bootstrap payload: an env script and the role's support files are shipped as a
//! `tar.gz` through object storage; the instance's startup data downloads and
//! unpacks it before running the template's own startup script.

use anyhow::Context;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use privcloud_common::{MachineRole, ProvisioningError, ProvisioningTask};
use privcloud_providers::{ObjectStore, StoredObject};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const ENV_SCRIPT_NAME: &str = "privcloud_env.sh";
pub const BOOTSTRAP_LOG: &str = "/tmp/privcloud-bootstrap.log";
const DOWNLOAD_NAME: &str = "privcloudArchive.tar.gz";
const LOCAL_IPV4_URL: &str = "http://instance-data/latest/meta-data/local-ipv4";

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub bucket: String,
    pub presign_ttl: Duration,
    pub remote_dir: String,
    pub agent_port: u16,
    pub lookup_port: u16,
    pub management_group: String,
    pub management_files_dir: Option<PathBuf>,
    pub worker_files_dir: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Remote directory without a trailing slash ("/" stays "/").
    pub fn remote_dir(&self) -> &str {
        trim_remote_dir(&self.remote_dir)
    }

    fn files_dir(&self, role: MachineRole) -> Option<&Path> {
        match role {
            MachineRole::Management => self.management_files_dir.as_deref(),
            MachineRole::Worker => self.worker_files_dir.as_deref(),
        }
    }
}

/// Per-machine values the host knows at provisioning time.
#[derive(Debug, Clone, Default)]
pub struct RemoteContext {
    pub location_id: Option<String>,
    /// Extra variables exported by the env script.
    pub env: BTreeMap<String, String>,
}

pub struct BootstrapPackage {
    /// Base64 startup data for the create call.
    pub user_data: String,
    pub handoff: StagedArchive,
}

/// Uploaded archive awaiting release.
///
/// `release` deletes the object; if the handle is dropped unreleased (task
/// cancelled between upload and create) the delete is spawned from `Drop`.
pub struct StagedArchive {
    store: Arc<dyn ObjectStore>,
    object: Option<StoredObject>,
    url: String,
}

impl StagedArchive {
    fn new(store: Arc<dyn ObjectStore>, object: StoredObject) -> Self {
        Self {
            store,
            object: Some(object),
            url: String::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Delete the object. The handle keeps it until the delete finishes, so a
    /// release cancelled midway still hands it to `Drop`.
    pub async fn release(mut self) {
        if let Some(object) = &self.object {
            delete_object(self.store.as_ref(), object).await;
        }
        self.object = None;
    }
}

impl Drop for StagedArchive {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    delete_object(store.as_ref(), &object).await;
                });
            }
            Err(_) => tracing::warn!(
                "⚠️ [bootstrap] no runtime to release {}/{}; object left in storage",
                object.bucket,
                object.key
            ),
        }
    }
}

async fn delete_object(store: &dyn ObjectStore, object: &StoredObject) {
    match store.delete(object).await {
        Ok(()) => tracing::debug!("[bootstrap] released {}/{}", object.bucket, object.key),
        Err(e) => tracing::warn!(
            "⚠️ [bootstrap] failed to delete {}/{}: {:#}",
            object.bucket,
            object.key,
            e
        ),
    }
}

pub struct BootstrapPackager {
    store: Arc<dyn ObjectStore>,
    config: BootstrapConfig,
}

impl BootstrapPackager {
    pub fn new(store: Arc<dyn ObjectStore>, config: BootstrapConfig) -> Self {
        Self { store, config }
    }

    pub async fn package(
        &self,
        task: &ProvisioningTask,
        ctx: &RemoteContext,
    ) -> Result<BootstrapPackage, ProvisioningError> {
        let script = env_script(&self.config, task, ctx)?;
        let support_dir = self.config.files_dir(task.role).map(Path::to_path_buf);

        let workdir = tempfile::Builder::new()
            .prefix("privcloud-bootstrap-")
            .tempdir()
            .map_err(ProvisioningError::bootstrap)?;
        let archive_path = workdir
            .path()
            .join(format!("privcloud-{}.tar.gz", uuid::Uuid::new_v4().simple()));

        let path = archive_path.clone();
        tokio::task::spawn_blocking(move || build_archive(support_dir.as_deref(), &script, &path))
            .await
            .map_err(ProvisioningError::bootstrap)?
            .map_err(|e| ProvisioningError::bootstrap(format!("{:#}", e)))?;

        let object = self
            .store
            .upload(&self.config.bucket, &archive_path)
            .await
            .map_err(|e| ProvisioningError::remote("upload_archive", e))?;
        let mut staged = StagedArchive::new(self.store.clone(), object.clone());

        let url = match self.store.presign(&object, self.config.presign_ttl).await {
            Ok(url) => url,
            Err(e) => {
                staged.release().await;
                return Err(ProvisioningError::remote("presign_archive", e));
            }
        };
        staged.url = url;

        let script = startup_script(
            staged.url(),
            self.config.remote_dir(),
            task.template.instance.user_data.as_deref(),
        );
        tracing::debug!("[bootstrap] startup data for {}:\n{}", task.desired_name, script);

        Ok(BootstrapPackage {
            user_data: base64::engine::general_purpose::STANDARD.encode(script.as_bytes()),
            handoff: staged,
        })
    }
}

pub fn trim_remote_dir(dir: &str) -> &str {
    if dir.len() > 1 {
        dir.strip_suffix('/').unwrap_or(dir)
    } else {
        dir
    }
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The env script sourced on the machine before its startup data runs.
pub fn env_script(
    config: &BootstrapConfig,
    task: &ProvisioningTask,
    ctx: &RemoteContext,
) -> Result<String, ProvisioningError> {
    let mut vars: Vec<(String, String)> = vec![
        ("PRIVCLOUD_MACHINE_NAME".into(), task.desired_name.clone()),
        ("PRIVCLOUD_MACHINE_ROLE".into(), task.role.as_str().into()),
        ("PRIVCLOUD_AGENT_PORT".into(), config.agent_port.to_string()),
        ("PRIVCLOUD_REMOTE_DIR".into(), config.remote_dir().into()),
        ("PRIVCLOUD_MANAGEMENT_GROUP".into(), config.management_group.clone()),
    ];
    if let Some(location) = ctx.location_id.as_deref().filter(|l| !l.is_empty()) {
        vars.push(("PRIVCLOUD_LOCATION_ID".into(), location.into()));
    }
    for (key, value) in &ctx.env {
        if !is_env_name(key) {
            return Err(ProvisioningError::bootstrap(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        vars.push((key.clone(), value.clone()));
    }

    let mut script = String::from("#!/bin/bash\n");
    for (key, value) in vars {
        script.push_str(&format!("export {}={}\n", key, shell_quote(&value)));
    }
    if task.role.is_management() {
        script.push_str(&format!(
            "export PRIVCLOUD_LOOKUP_ADDRESS=`curl -s {}`:{}\n",
            LOCAL_IPV4_URL, config.lookup_port
        ));
    }
    Ok(script)
}

/// Download-and-unpack preamble followed by the template's startup data.
pub fn startup_script(url: &str, remote_dir: &str, user_data: Option<&str>) -> String {
    let dir = trim_remote_dir(remote_dir);
    let env_path = format!("{}/{}", dir.trim_end_matches('/'), ENV_SCRIPT_NAME);
    let commands = [
        "export TMP_DIRECTORY=/tmp".to_string(),
        format!("export PRIVCLOUD_ARCHIVE_URL={}", shell_quote(url)),
        format!("wget -q -O $TMP_DIRECTORY/{} \"$PRIVCLOUD_ARCHIVE_URL\"", DOWNLOAD_NAME),
        format!("mkdir -p {}", dir),
        format!("tar zxvf $TMP_DIRECTORY/{} -C {}", DOWNLOAD_NAME, dir),
        format!("rm -f $TMP_DIRECTORY/{}", DOWNLOAD_NAME),
        format!("echo {}", env_path),
        format!("chmod 755 {}", env_path),
        format!("source {}", env_path),
    ];

    let mut script = String::from("#!/bin/bash\n");
    for command in commands {
        script.push_str(&format!("{} >> {}\n", command, BOOTSTRAP_LOG));
    }
    if let Some(data) = user_data {
        script.push_str(data);
    }
    script
}

/// Write `<support_dir>/*` plus the env script at the root of a gzipped tarball.
pub fn build_archive(support_dir: Option<&Path>, env_script: &str, dest: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    tar.follow_symlinks(false);

    if let Some(dir) = support_dir {
        anyhow::ensure!(dir.is_dir(), "support directory {} does not exist", dir.display());
        tar.append_dir_all(".", dir)
            .with_context(|| format!("failed to append directory `{}` to tarball", dir.display()))?;
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(env_script.len() as u64);
    header.set_mode(0o755);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(0);
    header.set_cksum();
    tar.append_data(&mut header, ENV_SCRIPT_NAME, env_script.as_bytes())
        .context("failed to append env script")?;

    let gz = tar.into_inner().context("failed to finish writing tarball")?;
    gz.finish().context("error finishing gz encoder")?;
    Ok(())
}
