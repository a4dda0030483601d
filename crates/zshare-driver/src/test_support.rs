//! Scripted collaborators shared by the driver test modules.

use crate::driver::ZfsDriver;
use crate::helpers::{HelperRegistry, ProtocolHelper};
use crate::store::MemoryStore;
use crate::teardown::TeardownPolicy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use zshare_common::{AccessRule, DriverConfig, Error, Result};
use zshare_exec::{CommandOutput, Executor};

/// Executor that records every argv and replays queued answers.
/// An empty queue answers success with empty output.
#[derive(Default)]
pub(crate) struct FakeExecutor {
    calls: Mutex<Vec<Vec<String>>>,
    retry_calls: Mutex<Vec<Vec<String>>>,
    responses: Mutex<VecDeque<Result<CommandOutput>>>,
    retry_responses: Mutex<VecDeque<Result<CommandOutput>>>,
}

impl FakeExecutor {
    pub fn push_ok(&self, stdout: &str) {
        self.responses
            .lock()
            .push_back(Ok(CommandOutput::new(stdout, "")));
    }

    pub fn push_err(&self, stderr: &str) {
        self.responses
            .lock()
            .push_back(Err(Error::process("fake", stderr)));
    }

    pub fn push_retry_err(&self, stderr: &str) {
        self.retry_responses
            .lock()
            .push_back(Err(Error::process("fake", stderr)));
    }

    /// Every `execute` argv, each joined into one string
    pub fn call_lines(&self) -> Vec<String> {
        self.calls.lock().iter().map(|argv| argv.join(" ")).collect()
    }

    /// Every `execute_with_retry` argv, each joined into one string
    pub fn retry_call_lines(&self) -> Vec<String> {
        self.retry_calls
            .lock()
            .iter()
            .map(|argv| argv.join(" "))
            .collect()
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, argv: &[&str]) -> Result<CommandOutput> {
        self.calls
            .lock()
            .push(argv.iter().map(ToString::to_string).collect());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }

    fn execute_with_retry(&self, argv: &[&str]) -> Result<CommandOutput> {
        self.retry_calls
            .lock()
            .push(argv.iter().map(ToString::to_string).collect());
        self.retry_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }
}

/// Protocol helper that records calls and returns fixed exports.
#[derive(Default)]
pub(crate) struct FakeHelper {
    calls: Mutex<Vec<String>>,
}

pub(crate) const FAKE_EXPORT: &str = "1.1.1.1:/exports/fake";

impl FakeHelper {
    pub fn call_lines(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl ProtocolHelper for FakeHelper {
    fn create_exports(&self, dataset_name: &str) -> Result<Vec<String>> {
        self.calls.lock().push(format!("create_exports {dataset_name}"));
        Ok(vec![FAKE_EXPORT.to_string()])
    }

    fn remove_exports(&self, dataset_name: &str) -> Result<()> {
        self.calls.lock().push(format!("remove_exports {dataset_name}"));
        Ok(())
    }

    fn get_exports(&self, dataset_name: &str) -> Result<Vec<String>> {
        self.calls.lock().push(format!("get_exports {dataset_name}"));
        Ok(vec![FAKE_EXPORT.to_string()])
    }

    fn update_access(
        &self,
        dataset_name: &str,
        _access_rules: &[AccessRule],
        _add_rules: &[AccessRule],
        _delete_rules: &[AccessRule],
        make_all_ro: bool,
    ) -> Result<()> {
        self.calls
            .lock()
            .push(format!("update_access {dataset_name} make_all_ro={make_all_ro}"));
        Ok(())
    }
}

pub(crate) fn test_config() -> DriverConfig {
    DriverConfig {
        backend_name: "fake_backend".to_string(),
        zpool_list: vec!["foo".to_string(), "bar/subbar".to_string(), "quuz".to_string()],
        share_export_ip: "1.1.1.1".to_string(),
        service_ip: "2.2.2.2".to_string(),
        ssh_username: "fake_username".to_string(),
        dataset_name_prefix: "share_".to_string(),
        snapshot_name_prefix: "snapshot_".to_string(),
        replica_snapshot_prefix: "tmp_snapshot_for_replication_".to_string(),
        dataset_creation_options: vec!["fook=foov".to_string(), "bark=barv".to_string()],
        ..DriverConfig::default()
    }
}

pub(crate) struct TestDriver {
    pub driver: ZfsDriver,
    pub executor: Arc<FakeExecutor>,
    pub store: Arc<MemoryStore>,
    pub helper: Arc<FakeHelper>,
}

pub(crate) fn build_driver(config: DriverConfig) -> TestDriver {
    let executor = Arc::new(FakeExecutor::default());
    let store = Arc::new(MemoryStore::new());
    let helper = Arc::new(FakeHelper::default());
    let helpers = HelperRegistry::new().with_helper("NFS", helper.clone() as _);
    let driver = ZfsDriver::new(config, executor.clone(), store.clone(), helpers)
        .expect("test driver config must be valid")
        .with_teardown_policy(TeardownPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
        ));
    TestDriver {
        driver,
        executor,
        store,
        helper,
    }
}

/// `zfs get` / `zpool get` style answer carrying one value
pub(crate) fn value_answer(name: &str, property: &str, value: &str) -> String {
    format!("NAME PROPERTY VALUE SOURCE\n{name} {property} {value} local\n")
}

/// `zfs list` style answer with one NAME column per row
pub(crate) fn name_answer(names: &[&str]) -> String {
    let mut out = String::from("NAME\n");
    for name in names {
        out.push_str(name);
        out.push('\n');
    }
    out
}
