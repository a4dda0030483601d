//! Share and snapshot lifecycle on ZFS datasets
//!
//! `ZfsDriver` is the backend core invoked by the orchestrator. It
//! owns the validated configuration, shells out to `zfs`/`zpool`
//! (optionally over SSH), keeps resolved names in the entity store and
//! delegates export management to the per-protocol helpers.
//!
//! The driver model is host-less: any operation invoked with a share
//! server fails with an invalid-request error before touching storage.

use crate::helpers::HelperRegistry;
use crate::naming::NameScheme;
use crate::store::{keys, EntityStore};
use crate::teardown::TeardownPolicy;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use zshare_common::{
    AccessRule, DriverConfig, Error, PoolInfo, Result, Share, ShareServer, Snapshot,
};
use zshare_exec::{parse_table, CommandOutput, Executor};

/// Replication kind advertised to the scheduler when a replication
/// domain is configured.
const REPLICATION_TYPE: &str = "readable";

/// ZFS share driver core
pub struct ZfsDriver {
    pub(crate) config: DriverConfig,
    pub(crate) names: NameScheme,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) store: Arc<dyn EntityStore>,
    pub(crate) helpers: HelperRegistry,
    pub(crate) teardown: TeardownPolicy,
}

impl std::fmt::Debug for ZfsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZfsDriver")
            .field("backend", &self.config.backend_name)
            .field("helpers", &self.helpers)
            .field("teardown", &self.teardown)
            .finish_non_exhaustive()
    }
}

fn validate_ip(label: &str, value: &str) -> Result<()> {
    let addr: IpAddr = value
        .parse()
        .map_err(|_| Error::configuration(format!("{label} `{value}` is not an IP address")))?;
    if addr.is_unspecified() {
        return Err(Error::configuration(format!(
            "{label} `{value}` must name a concrete address"
        )));
    }
    Ok(())
}

fn reject_share_server(share_server: Option<&ShareServer>) -> Result<()> {
    match share_server {
        None => Ok(()),
        Some(server) => Err(Error::invalid_request(format!(
            "share server `{}` passed to a host-less backend",
            server.id
        ))),
    }
}

/// Convert a `zfs`/`zpool` size value (`24K`, `1.5G`, `2T`, plain
/// bytes) into gigabytes.
pub(crate) fn parse_size_gb(value: &str) -> Result<f64> {
    let value = value.trim();
    let bad = || Error::Parse(format!("unreadable size value `{value}`"));
    let (digits, scale) = match value.as_bytes().last().map(u8::to_ascii_uppercase) {
        Some(b'T') => (&value[..value.len() - 1], 1024.0),
        Some(b'G') => (&value[..value.len() - 1], 1.0),
        Some(b'M') => (&value[..value.len() - 1], 1.0 / 1024.0),
        Some(b'K') => (&value[..value.len() - 1], 1.0 / (1024.0 * 1024.0)),
        Some(b'0'..=b'9') => (value, 1.0 / (1024.0 * 1024.0 * 1024.0)),
        _ => return Err(bad()),
    };
    let number: f64 = digits.parse().map_err(|_| bad())?;
    Ok(number * scale)
}

impl ZfsDriver {
    /// Build a driver from configuration and its collaborators.
    ///
    /// Fails fast on an invalid pool list, unusable export or service
    /// addresses, or an empty helper registry: a driver that cannot
    /// serve any protocol is a deployment mistake.
    pub fn new(
        config: DriverConfig,
        executor: Arc<dyn Executor>,
        store: Arc<dyn EntityStore>,
        helpers: HelperRegistry,
    ) -> Result<Self> {
        let names = NameScheme::new(&config)?;
        validate_ip("share export IP", &config.share_export_ip)?;
        validate_ip("service IP", &config.service_ip)?;
        if helpers.is_empty() {
            return Err(Error::configuration("no protocol helpers registered"));
        }
        Ok(Self {
            config,
            names,
            executor,
            store,
            helpers,
            teardown: TeardownPolicy::default(),
        })
    }

    /// Replace the default teardown pacing
    #[must_use]
    pub fn with_teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.teardown = policy;
        self
    }

    /// Run a command on the service host, over SSH when configured
    pub(crate) fn shell(&self, argv: &[&str], privileged: bool) -> Result<CommandOutput> {
        if !self.config.use_ssh {
            return self.executor.execute(argv);
        }
        let timeout = format!("-oConnectTimeout={}", self.config.ssh_conn_timeout_secs);
        let target = self.config.service_ssh_target();
        let mut full: Vec<&str> = Vec::with_capacity(argv.len() + 4);
        full.extend(["ssh", timeout.as_str(), target.as_str()]);
        if privileged {
            full.push("sudo");
        }
        full.extend_from_slice(argv);
        self.executor.execute(&full)
    }

    pub(crate) fn zfs(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut argv: Vec<&str> = Vec::with_capacity(args.len() + 1);
        argv.push("zfs");
        argv.extend_from_slice(args);
        self.shell(&argv, true)
    }

    fn extract_value(stdout: &str, name: &str, option: &str) -> Result<String> {
        parse_table(stdout)?
            .first()
            .and_then(|row| row.value())
            .map(ToString::to_string)
            .ok_or_else(|| Error::Parse(format!("no `{option}` value reported for `{name}`")))
    }

    /// Read one property of a dataset or snapshot
    pub(crate) fn get_zfs_option(&self, name: &str, option: &str) -> Result<String> {
        let out = self.zfs(&["get", option, name])?;
        Self::extract_value(&out.stdout, name, option)
    }

    /// Read one property of a pool
    pub(crate) fn get_zpool_option(&self, pool: &str, option: &str) -> Result<String> {
        let out = self.shell(&["zpool", "get", option, pool], true)?;
        Self::extract_value(&out.stdout, pool, option)
    }

    /// `-o` options applied when creating a dataset.
    ///
    /// Configured options come first; `readonly`, `sharenfs` and
    /// `sharesmb` are reserved for the driver and dropped if
    /// configured, then the computed `readonly` and `quota` follow.
    pub(crate) fn dataset_creation_options(&self, size_gb: u64, readonly: bool) -> Vec<String> {
        let mut options: Vec<String> = self
            .config
            .dataset_creation_options
            .iter()
            .filter(|opt| {
                !matches!(
                    opt.split('=').next(),
                    Some("readonly" | "sharenfs" | "sharesmb")
                )
            })
            .cloned()
            .collect();
        options.push(format!(
            "readonly={}",
            if readonly { "on" } else { "off" }
        ));
        options.push(format!("quota={size_gb}G"));
        options
    }

    /// Dataset name for a share: the stored name when known, otherwise
    /// re-derived from the share's placement.
    pub(crate) fn share_dataset_name(&self, share: &Share) -> Result<String> {
        if let Some(name) = self.store.get(&share.id, keys::DATASET_NAME) {
            return Ok(name);
        }
        self.names.dataset_name(share.pool()?, &share.id)
    }

    fn snapshot_full_name(&self, snapshot: &Snapshot) -> Result<String> {
        if let Some(name) = self.store.get(&snapshot.id, keys::SNAPSHOT_NAME) {
            return Ok(name);
        }
        let pool = zshare_common::pool_from_host(&snapshot.host)?;
        let dataset_name = match self.store.get(&snapshot.share_id, keys::DATASET_NAME) {
            Some(name) => name,
            None => self.names.dataset_name(pool, &snapshot.share_id)?,
        };
        Ok(format!(
            "{dataset_name}@{}",
            self.names.snapshot_name(&snapshot.id)
        ))
    }

    fn persist_share(&self, share: &Share, pool: &str, dataset_name: &str) {
        let ssh_cmd = self.config.service_ssh_target();
        self.store.update(
            &share.id,
            &[
                (keys::ENTITY_TYPE, "share"),
                (keys::DATASET_NAME, dataset_name),
                (keys::POOL_NAME, pool),
                (keys::SSH_CMD, &ssh_cmd),
            ],
        );
    }

    /// Create the dataset backing a new share and export it
    pub fn create_share(
        &self,
        share: &Share,
        share_server: Option<&ShareServer>,
    ) -> Result<Vec<String>> {
        reject_share_server(share_server)?;
        let pool = share.pool()?;
        let dataset_name = self.names.dataset_name(pool, &share.id)?;
        let options = self.dataset_creation_options(share.size_gb, false);

        let mut args: Vec<&str> = vec!["create"];
        for option in &options {
            args.push("-o");
            args.push(option);
        }
        args.push(&dataset_name);
        self.zfs(&args)?;

        self.persist_share(share, pool, &dataset_name);
        debug!(share_id = %share.id, dataset = %dataset_name, "created share dataset");
        self.helpers
            .get(&share.share_proto)?
            .create_exports(&dataset_name)
    }

    /// Delete a share's dataset along with every snapshot it still
    /// carries. An already absent dataset is logged and treated as
    /// deleted.
    pub fn delete_share(&self, share: &Share, share_server: Option<&ShareServer>) -> Result<()> {
        reject_share_server(share_server)?;
        let pool = match self.store.get(&share.id, keys::POOL_NAME) {
            Some(pool) => pool,
            None => share.pool()?.to_string(),
        };
        let dataset_name = self.share_dataset_name(share)?;

        let out = self.zfs(&["list", "-r", &pool])?;
        let present = parse_table(&out.stdout)?
            .iter()
            .any(|row| row.name() == dataset_name);
        if present {
            self.helpers
                .get(&share.share_proto)?
                .remove_exports(&dataset_name)?;
            let out = self.zfs(&["list", "-r", "-t", "snapshot", &pool])?;
            let snapshot_prefix = format!("{dataset_name}@");
            for row in parse_table(&out.stdout)? {
                if row.name().starts_with(&snapshot_prefix) {
                    self.delete_dataset_or_snapshot_with_retry(row.name())?;
                }
            }
            self.delete_dataset_or_snapshot_with_retry(&dataset_name)?;
        } else {
            warn!(
                share_id = %share.id,
                dataset = %dataset_name,
                "dataset not found on deletion, considering it gone"
            );
        }
        self.store.delete(&share.id);
        Ok(())
    }

    /// Take a snapshot of a share, returning the full snapshot name
    pub fn create_snapshot(
        &self,
        snapshot: &Snapshot,
        share_server: Option<&ShareServer>,
    ) -> Result<String> {
        reject_share_server(share_server)?;
        let snapshot_name = self.snapshot_full_name(snapshot)?;
        self.zfs(&["snapshot", &snapshot_name])?;
        self.store
            .update(&snapshot.id, &[(keys::SNAPSHOT_NAME, &snapshot_name)]);
        Ok(snapshot_name)
    }

    /// Delete a snapshot; an already absent one is logged and skipped
    pub fn delete_snapshot(
        &self,
        snapshot: &Snapshot,
        share_server: Option<&ShareServer>,
    ) -> Result<()> {
        reject_share_server(share_server)?;
        let snapshot_name = self.snapshot_full_name(snapshot)?;
        let pool = snapshot_name
            .split('/')
            .next()
            .unwrap_or(snapshot_name.as_str());

        let out = self.zfs(&["list", "-r", "-t", "snapshot", pool])?;
        let present = parse_table(&out.stdout)?
            .iter()
            .any(|row| row.name() == snapshot_name);
        if present {
            self.delete_dataset_or_snapshot_with_retry(&snapshot_name)?;
        } else {
            warn!(
                snapshot_id = %snapshot.id,
                snapshot = %snapshot_name,
                "snapshot not found on deletion, considering it gone"
            );
        }
        self.store.delete(&snapshot.id);
        Ok(())
    }

    /// Create a share as a writable clone of an existing snapshot
    pub fn create_share_from_snapshot(
        &self,
        share: &Share,
        snapshot: &Snapshot,
        share_server: Option<&ShareServer>,
    ) -> Result<Vec<String>> {
        reject_share_server(share_server)?;
        let pool = share.pool()?;
        let dataset_name = self.names.dataset_name(pool, &share.id)?;
        let snapshot_name = self.snapshot_full_name(snapshot)?;
        let quota = format!("quota={}G", share.size_gb);

        self.zfs(&["clone", &snapshot_name, &dataset_name, "-o", &quota])?;

        self.persist_share(share, pool, &dataset_name);
        self.helpers
            .get(&share.share_proto)?
            .create_exports(&dataset_name)
    }

    /// Verify a share survived a service restart and return its
    /// exports. Re-issues `zfs share` for datasets carrying a sharenfs
    /// configuration, since a host reboot drops the NFS export.
    pub fn ensure_share(
        &self,
        share: &Share,
        share_server: Option<&ShareServer>,
    ) -> Result<Vec<String>> {
        reject_share_server(share_server)?;
        let pool = match self.store.get(&share.id, keys::POOL_NAME) {
            Some(pool) => pool,
            None => share.pool()?.to_string(),
        };
        let dataset_name = self.share_dataset_name(share)?;

        // the service address may have changed across restarts
        let ssh_cmd = self.config.service_ssh_target();
        self.store.update(&share.id, &[(keys::SSH_CMD, &ssh_cmd)]);

        let out = self.zfs(&["list", "-r", &pool])?;
        let present = parse_table(&out.stdout)?
            .iter()
            .any(|row| row.name() == dataset_name);
        if !present {
            return Err(Error::NotFound(format!(
                "dataset `{dataset_name}` backing share `{}`",
                share.id
            )));
        }
        let sharenfs = self.get_zfs_option(&dataset_name, "sharenfs")?;
        if sharenfs != "off" {
            self.zfs(&["share", &dataset_name])?;
        }
        self.helpers
            .get(&share.share_proto)?
            .get_exports(&dataset_name)
    }

    /// Raise a share's quota
    pub fn extend_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        share_server: Option<&ShareServer>,
    ) -> Result<()> {
        reject_share_server(share_server)?;
        let dataset_name = self.share_dataset_name(share)?;
        self.set_quota(&dataset_name, new_size_gb)
    }

    /// Lower a share's quota, refusing when consumed space already
    /// reaches the requested size.
    pub fn shrink_share(
        &self,
        share: &Share,
        new_size_gb: u64,
        share_server: Option<&ShareServer>,
    ) -> Result<()> {
        reject_share_server(share_server)?;
        let dataset_name = self.share_dataset_name(share)?;
        let used = parse_size_gb(&self.get_zfs_option(&dataset_name, "used")?)?;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        if used >= new_size_gb as f64 {
            return Err(Error::ShrinkPossibleDataLoss {
                name: dataset_name,
                requested_gb: new_size_gb,
                used_gb: used.ceil() as u64,
            });
        }
        self.set_quota(&dataset_name, new_size_gb)
    }

    pub(crate) fn set_quota(&self, dataset_name: &str, size_gb: u64) -> Result<()> {
        let quota = format!("quota={size_gb}G");
        self.zfs(&["set", &quota, dataset_name])?;
        Ok(())
    }

    /// Apply access rule changes through the protocol helper
    pub fn update_access(
        &self,
        share: &Share,
        access_rules: &[AccessRule],
        add_rules: &[AccessRule],
        delete_rules: &[AccessRule],
        share_server: Option<&ShareServer>,
    ) -> Result<()> {
        reject_share_server(share_server)?;
        let dataset_name = self.share_dataset_name(share)?;
        self.helpers.get(&share.share_proto)?.update_access(
            &dataset_name,
            access_rules,
            add_rules,
            delete_rules,
            false,
        )
    }

    /// Forget a share without touching its dataset
    pub fn unmanage(&self, share: &Share) {
        self.store.delete(&share.id);
    }

    /// Pool a share is placed on: the recorded pool when known,
    /// otherwise taken from the share's placement string.
    pub fn get_pool(&self, share: &Share) -> Result<String> {
        match self.store.get(&share.id, keys::POOL_NAME) {
            Some(pool) => Ok(pool),
            None => Ok(share.pool()?.to_string()),
        }
    }

    /// Capacity report for every configured pool
    pub fn pools_info(&self) -> Result<Vec<PoolInfo>> {
        let replication_type = self
            .config
            .replication_domain
            .as_ref()
            .map(|_| REPLICATION_TYPE.to_string());
        let mut pools = Vec::new();
        for root in self.names.pool_roots() {
            let total = parse_size_gb(&self.get_zpool_option(root, "size")?)?;
            let free = parse_size_gb(&self.get_zpool_option(root, "free")?)?;
            pools.push(PoolInfo {
                pool_name: root.to_string(),
                total_capacity_gb: total,
                free_capacity_gb: free,
                reserved_percentage: self.config.reserved_percentage,
                replication_type: replication_type.clone(),
            });
        }
        Ok(pools)
    }
}
