//! The apply pipeline: the single critical section that turns current
//! store state into a running sing-box process. One invocation walks
//! Load → Synth → validate-contract → Preflight → snapshot → atomic
//! write → Restart → Commit, with rollback to the previous config (or
//! the last known good one) on a failed restart.

use relaybox_core::{sha256_hex, Error};
use relaybox_policy::ProbeView;
use relaybox_store::nodes::NodeRow;
use relaybox_store::proxy_settings::ProxySettingsRow;
use relaybox_store::runtime_state::RuntimeStateRow;
use relaybox_synth::{ExternalController, ProxyInbound};
use sqlx::sqlite::SqlitePool;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONFIG_ENV_VAR: &str = "SINGBOX_CONFIG";
const CANDIDATE_SUFFIX: &str = ".candidate";
const TMP_SUFFIX: &str = ".tmp";
const LAST_GOOD_SUFFIX: &str = ".last-good";
const MAX_COMMAND_OUTPUT: usize = 2048;

/// Inputs the caller must supply for one [`ApplyPipeline::reload`] call.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Path the live runtime config is written to.
    pub config_path: PathBuf,
    /// Shell command template that validates a candidate config.
    pub check_cmd: Option<String>,
    /// Shell command template that restarts the engine against a config.
    pub restart_cmd: Option<String>,
    /// Clash-API controller block to attach, if configured.
    pub external_controller: Option<ExternalController>,
}

impl ApplyOptions {
    /// Builds options from the daemon's top-level configuration. The
    /// clash-api controller block is attached only when an address is
    /// configured, matching the synthesiser's "emitted only when
    /// configured" contract.
    pub fn from_config(config: &relaybox_core::Config) -> Self {
        let external_controller = config.external_controller.as_ref().map(|address| {
            ExternalController {
                external_controller: address.clone(),
                secret: config.external_controller_secret.clone(),
            }
        });
        Self {
            config_path: config.config_path.clone(),
            check_cmd: config.check_cmd.clone(),
            restart_cmd: config.restart_cmd.clone(),
            external_controller,
        }
    }
}

/// What one successful reload produced.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The new `config_version`.
    pub version: i64,
    /// Hex SHA-256 of the accepted config bytes.
    pub hash: String,
    /// Combined stdout/stderr of the restart command.
    pub restart_output: Vec<u8>,
}

/// Owns the single serialised critical section every reload passes
/// through. Acquired FIFO via `Mutex::lock`, never `try_lock`, so queued
/// reloads wait their turn instead of being rejected.
pub struct ApplyPipeline {
    lock: Mutex<()>,
}

impl Default for ApplyPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplyPipeline {
    /// Builds a fresh, unlocked pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    /// Runs one reload to completion. `cancel` is expected to be wired to
    /// the caller's cancellation context (an inbound HTTP request, or the
    /// daemon's shutdown signal); a cancellation fired mid-command aborts
    /// the running child process but does not skip the rollback/commit
    /// bookkeeping that follows.
    pub async fn reload(
        &self,
        pool: &SqlitePool,
        opts: &ApplyOptions,
        cancel: CancellationToken,
    ) -> Result<ApplyOutcome, Error> {
        let _guard = self.lock.lock().await;
        let start = Instant::now();
        let prev_state = relaybox_store::runtime_state::load(pool).await?;

        let result = run_pipeline(pool, opts, &cancel, &prev_state).await;
        let elapsed_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok((outcome, node_count)) => {
                relaybox_store::runtime_state::record_success(
                    pool,
                    outcome.version,
                    &outcome.hash,
                    node_count,
                    elapsed_ms,
                )
                .await?;
                info!(version = outcome.version, nodes = node_count, "apply pipeline: reload succeeded");
                Ok(outcome)
            }
            Err((err, node_count)) => {
                if let Err(record_err) =
                    relaybox_store::runtime_state::record_failure(pool, &err.message, node_count, elapsed_ms)
                        .await
                {
                    warn!(error = %record_err, "apply pipeline: failed to record failure state");
                }
                warn!(code = err.code, nodes = node_count, "apply pipeline: reload failed");
                Err(err)
            }
        }
    }
}

async fn run_pipeline(
    pool: &SqlitePool,
    opts: &ApplyOptions,
    cancel: &CancellationToken,
    prev_state: &RuntimeStateRow,
) -> Result<(ApplyOutcome, i64), (Error, i64)> {
    let http_row = relaybox_store::proxy_settings::get(pool, "http")
        .await
        .map_err(|e| (e, 0))?;
    let socks_row = relaybox_store::proxy_settings::get(pool, "socks")
        .await
        .map_err(|e| (e, 0))?;
    let routing = relaybox_store::routing_settings::load(pool)
        .await
        .map_err(|e| (e, 0))?;
    let policy = relaybox_store::forwarding_policy::load(pool)
        .await
        .map_err(|e| (e, 0))?;
    let nodes = relaybox_store::nodes::list_enabled_forwarding(pool)
        .await
        .map_err(|e| (e, 0))?;

    let forwarding_running = prev_state.forwarding_running;
    let mut http_in = to_proxy_inbound(&http_row);
    let mut socks_in = to_proxy_inbound(&socks_row);
    if !forwarding_running {
        http_in.enabled = false;
        socks_in.enabled = false;
    }

    let eligible = eligible_nodes(&nodes, &policy);
    let node_count = i64::try_from(eligible.len()).unwrap_or(i64::MAX);
    let any_inbound_enabled = http_in.enabled || socks_in.enabled;
    if forwarding_running && any_inbound_enabled && eligible.is_empty() {
        return Err((
            Error::new("CFG_NO_ENABLED_NODES", "no eligible nodes to forward through"),
            0,
        ));
    }

    let node_jsons: Vec<String> = eligible.iter().map(|n| n.outbound_json.clone()).collect();
    let bytes = relaybox_synth::synth(
        &http_in,
        &socks_in,
        &routing,
        &node_jsons,
        opts.external_controller.as_ref(),
    )
    .map_err(|e| (e, node_count))?;
    let hash = sha256_hex(&bytes);

    let restart_cmd =
        validate_contract(&opts.config_path, opts.restart_cmd.as_deref()).map_err(|e| (e, node_count))?;

    preflight(&opts.config_path, &bytes, opts.check_cmd.as_deref(), cancel)
        .await
        .map_err(|e| (e, node_count))?;

    if let Some(dir) = opts.config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| (Error::new("CFG_WRITE_FAILED", format!("create config dir failed: {e}")), node_count))?;
    }

    let prev_bytes = match tokio::fs::read(&opts.config_path).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err((
                Error::new("CFG_WRITE_FAILED", format!("read current config failed: {e}")),
                node_count,
            ))
        }
    };

    atomic_write(&opts.config_path, &bytes)
        .await
        .map_err(|e| (Error::new("CFG_WRITE_FAILED", format!("write runtime config failed: {e}")), node_count))?;

    let restart_outcome = run_shell(&restart_cmd, &opts.config_path, cancel).await;

    if restart_outcome.success {
        if let Err(e) = save_last_good(&opts.config_path, &bytes).await {
            warn!(error = %e, "apply pipeline: failed to snapshot last-known-good config");
        }
        return Ok((
            ApplyOutcome {
                version: prev_state.config_version + 1,
                hash,
                restart_output: restart_outcome.output,
            },
            node_count,
        ));
    }

    let rollback = match prev_bytes.filter(|b| !b.is_empty()) {
        Some(bytes) => Some((bytes, "previous_config")),
        None => load_last_good(&opts.config_path)
            .await
            .filter(|b| !b.is_empty())
            .map(|bytes| (bytes, "last_known_good")),
    };

    let Some((rollback_bytes, rollback_source)) = rollback else {
        let err = Error::new("RT_RESTART_FAILED", "restart failed")
            .with_detail("rollback_attempted", "false")
            .with_detail(
                "restart_output",
                Error::truncate_output(&restart_outcome.output, MAX_COMMAND_OUTPUT),
            );
        return Err((err, node_count));
    };

    if let Err(e) = atomic_write(&opts.config_path, &rollback_bytes).await {
        let err = Error::new("CFG_ROLLBACK_FAILED", "restart failed and rollback write failed")
            .with_detail("rollback_source", rollback_source)
            .with_detail(
                "restart_output",
                Error::truncate_output(&restart_outcome.output, MAX_COMMAND_OUTPUT),
            )
            .with_detail("rollback_error", e.to_string());
        return Err((err, node_count));
    }

    let rollback_restart = run_shell(&restart_cmd, &opts.config_path, cancel).await;
    if rollback_restart.success {
        let err = Error::new("RT_RESTART_FAILED", "restart failed; rollback succeeded")
            .with_detail("rollback_attempted", "true")
            .with_detail("rollback_success", "true")
            .with_detail("rollback_source", rollback_source)
            .with_detail(
                "restart_output",
                Error::truncate_output(&restart_outcome.output, MAX_COMMAND_OUTPUT),
            )
            .with_detail(
                "rollback_output",
                Error::truncate_output(&rollback_restart.output, MAX_COMMAND_OUTPUT),
            );
        return Err((err, node_count));
    }

    let err = Error::new("CFG_ROLLBACK_FAILED", "restart failed and rollback restart failed")
        .with_detail("rollback_source", rollback_source)
        .with_detail(
            "restart_output",
            Error::truncate_output(&restart_outcome.output, MAX_COMMAND_OUTPUT),
        )
        .with_detail(
            "rollback_output",
            Error::truncate_output(&rollback_restart.output, MAX_COMMAND_OUTPUT),
        );
    Err((err, node_count))
}

fn eligible_nodes<'a>(nodes: &'a [NodeRow], policy: &relaybox_policy::ForwardingPolicy) -> Vec<&'a NodeRow> {
    let views: Vec<ProbeView> = nodes
        .iter()
        .map(|n| ProbeView {
            last_test_status: n.last_test_status.clone(),
            last_latency_ms: n.last_latency_ms,
        })
        .collect();
    relaybox_policy::filter_eligible(&views, policy)
        .into_iter()
        .map(|i| &nodes[i])
        .collect()
}

fn to_proxy_inbound(row: &ProxySettingsRow) -> ProxyInbound {
    ProxyInbound {
        listen_address: row.listen_address.clone(),
        port: u16::try_from(row.port).unwrap_or(0),
        enabled: row.enabled,
        auth_mode: row.auth_mode.clone(),
        username: row.username.clone().unwrap_or_default(),
        password: row.password.clone().unwrap_or_default(),
    }
}

/// Checks that a restart command is configured and that the ambient
/// `SINGBOX_CONFIG` environment value names the same file the caller
/// asked to apply to. Returns the trimmed restart command on success.
fn validate_contract(config_path: &Path, restart_cmd: Option<&str>) -> Result<String, Error> {
    let restart_cmd = restart_cmd
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::missing_field("restart_cmd"))?;
    let env_value = std::env::var(CONFIG_ENV_VAR).unwrap_or_default();
    let env_value = env_value.trim();
    if env_value.is_empty() {
        return Err(Error::missing_field(CONFIG_ENV_VAR));
    }
    if lexically_clean(Path::new(env_value)) != lexically_clean(config_path) {
        return Err(Error::invalid_field(CONFIG_ENV_VAR, env_value.to_string()));
    }
    Ok(restart_cmd.to_string())
}

/// Normalizes `.`/`..` path components without touching the filesystem, so
/// paths that don't exist yet still compare equal when they name the same
/// file. `std::fs::canonicalize` isn't usable here: the config path doesn't
/// necessarily exist at validation time.
fn lexically_clean(path: &Path) -> std::path::PathBuf {
    let mut out = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Writes `bytes` to `<config_path>.candidate`, runs the check command
/// against it, and always removes the candidate file afterward.
async fn preflight(
    config_path: &Path,
    bytes: &[u8],
    check_cmd: Option<&str>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let check_cmd = check_cmd
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::missing_field("check_cmd"))?;

    let candidate_path = append_suffix(config_path, CANDIDATE_SUFFIX);
    tokio::fs::write(&candidate_path, bytes)
        .await
        .map_err(|e| Error::new("CFG_WRITE_FAILED", format!("write candidate config failed: {e}")))?;

    let outcome = run_shell(check_cmd, &candidate_path, cancel).await;
    let _ = tokio::fs::remove_file(&candidate_path).await;

    if outcome.success {
        Ok(())
    } else {
        Err(Error::new("CFG_CHECK_FAILED", "config check failed")
            .with_detail("output", Error::truncate_output(&outcome.output, MAX_COMMAND_OUTPUT)))
    }
}

struct CommandOutcome {
    success: bool,
    output: Vec<u8>,
}

/// Runs `cmdline` via `sh -lc`, with `SINGBOX_CONFIG` set to
/// `config_path` in its environment. A cancellation fired while the
/// child is running kills it (via `kill_on_drop`) and is reported as a
/// failed outcome rather than propagated as an I/O error, so the caller's
/// rollback/commit bookkeeping still runs.
async fn run_shell(cmdline: &str, config_path: &Path, cancel: &CancellationToken) -> CommandOutcome {
    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-lc")
        .arg(cmdline)
        .env(CONFIG_ENV_VAR, config_path.as_os_str())
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                success: false,
                output: format!("spawn failed: {e}").into_bytes(),
            }
        }
    };

    tokio::select! {
        result = child.wait_with_output() => match result {
            Ok(output) => {
                let mut combined = output.stdout;
                combined.extend_from_slice(&output.stderr);
                CommandOutcome { success: output.status.success(), output: combined }
            }
            Err(e) => CommandOutcome {
                success: false,
                output: format!("wait failed: {e}").into_bytes(),
            },
        },
        () = cancel.cancelled() => CommandOutcome {
            success: false,
            output: b"cancelled: external command aborted".to_vec(),
        },
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = append_suffix(path, TMP_SUFFIX);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn save_last_good(config_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    atomic_write(&append_suffix(config_path, LAST_GOOD_SUFFIX), bytes).await
}

async fn load_last_good(config_path: &Path) -> Option<Vec<u8>> {
    tokio::fs::read(append_suffix(config_path, LAST_GOOD_SUFFIX)).await.ok()
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os_string = path.as_os_str().to_os_string();
    os_string.push(suffix);
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // SINGBOX_CONFIG is process-wide; serialise the tests that touch it
    // so they don't race each other's env::set_var.
    static ENV_GUARD: StdMutex<()> = StdMutex::new(());

    async fn memory_pool() -> SqlitePool {
        relaybox_store::open("sqlite::memory:").await.unwrap()
    }

    #[test]
    fn validate_contract_rejects_missing_restart_cmd() {
        let _guard = ENV_GUARD.lock().unwrap();
        let err = validate_contract(Path::new("/tmp/sing-box.json"), None).unwrap_err();
        assert_eq!(err.code, "REQ_MISSING_FIELD");
    }

    #[test]
    fn validate_contract_rejects_missing_env() {
        let _guard = ENV_GUARD.lock().unwrap();
        std::env::remove_var(CONFIG_ENV_VAR);
        let err = validate_contract(Path::new("/tmp/sing-box.json"), Some("echo ok")).unwrap_err();
        assert_eq!(err.code, "REQ_MISSING_FIELD");
    }

    #[test]
    fn validate_contract_rejects_path_mismatch() {
        let _guard = ENV_GUARD.lock().unwrap();
        std::env::set_var(CONFIG_ENV_VAR, "/tmp/other.json");
        let err = validate_contract(Path::new("/tmp/sing-box.json"), Some("echo ok")).unwrap_err();
        assert_eq!(err.code, "REQ_INVALID_FIELD");
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[test]
    fn validate_contract_accepts_matching_path() {
        let _guard = ENV_GUARD.lock().unwrap();
        std::env::set_var(CONFIG_ENV_VAR, "/tmp/sing-box.json");
        let cmd = validate_contract(Path::new("/tmp/sing-box.json"), Some("  echo ok  ")).unwrap();
        assert_eq!(cmd, "echo ok");
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[test]
    fn validate_contract_accepts_non_canonical_equivalent_path() {
        let _guard = ENV_GUARD.lock().unwrap();
        std::env::set_var(CONFIG_ENV_VAR, "/tmp/./sub/../sing-box.json");
        let cmd = validate_contract(Path::new("/tmp/sing-box.json"), Some("echo ok")).unwrap();
        assert_eq!(cmd, "echo ok");
        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[tokio::test]
    async fn run_shell_captures_combined_output() {
        let outcome = run_shell(
            "echo out; echo err >&2",
            Path::new("/tmp/does-not-matter.json"),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.success);
        let text = String::from_utf8_lossy(&outcome.output);
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn run_shell_reports_nonzero_exit_as_failure() {
        let outcome = run_shell("exit 3", Path::new("/tmp/does-not-matter.json"), &CancellationToken::new()).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn run_shell_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_shell("sleep 5", Path::new("/tmp/does-not-matter.json"), &cancel).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn preflight_removes_candidate_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sing-box.json");
        let outcome = preflight(&config_path, b"{}", Some("exit 0"), &CancellationToken::new()).await;
        assert!(outcome.is_ok());
        assert!(!append_suffix(&config_path, CANDIDATE_SUFFIX).exists());
    }

    #[tokio::test]
    async fn preflight_reports_check_failure_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sing-box.json");
        let err = preflight(&config_path, b"{}", Some("echo broken >&2; exit 1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, "CFG_CHECK_FAILED");
        assert!(!append_suffix(&config_path, CANDIDATE_SUFFIX).exists());
    }

    #[tokio::test]
    async fn atomic_write_then_rename_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sing-box.json");
        atomic_write(&config_path, b"hello").await.unwrap();
        assert_eq!(tokio::fs::read(&config_path).await.unwrap(), b"hello");
        assert!(!append_suffix(&config_path, TMP_SUFFIX).exists());
    }

    #[tokio::test]
    async fn reload_without_forwarding_running_skips_no_enabled_nodes_check() {
        let _guard = ENV_GUARD.lock().unwrap();
        let pool = memory_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sing-box.json");
        std::env::set_var(CONFIG_ENV_VAR, &config_path);

        relaybox_store::proxy_settings::upsert(&pool, "http", true, "0.0.0.0", 7890, "none", None, None)
            .await
            .unwrap();

        let opts = ApplyOptions {
            config_path: config_path.clone(),
            check_cmd: Some("exit 0".to_string()),
            restart_cmd: Some("exit 0".to_string()),
            external_controller: None,
        };
        let pipeline = ApplyPipeline::new();
        let outcome = pipeline.reload(&pool, &opts, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.version, 1);

        let state = relaybox_store::runtime_state::load(&pool).await.unwrap();
        assert_eq!(state.config_version, 1);
        assert!(state.last_apply_success_at.is_some());

        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[tokio::test]
    async fn reload_fails_with_no_enabled_nodes_when_forwarding_running() {
        let _guard = ENV_GUARD.lock().unwrap();
        let pool = memory_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sing-box.json");
        std::env::set_var(CONFIG_ENV_VAR, &config_path);

        relaybox_store::proxy_settings::upsert(&pool, "http", true, "0.0.0.0", 7890, "none", None, None)
            .await
            .unwrap();
        relaybox_store::runtime_state::set_forwarding_running(&pool, true).await.unwrap();

        let opts = ApplyOptions {
            config_path: config_path.clone(),
            check_cmd: Some("exit 0".to_string()),
            restart_cmd: Some("exit 0".to_string()),
            external_controller: None,
        };
        let pipeline = ApplyPipeline::new();
        let err = pipeline.reload(&pool, &opts, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code, "CFG_NO_ENABLED_NODES");

        let state = relaybox_store::runtime_state::load(&pool).await.unwrap();
        assert_eq!(state.config_version, 0);
        assert!(state.last_reload_error.is_some());

        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[tokio::test]
    async fn reload_rolls_back_and_reports_restart_failure() {
        let _guard = ENV_GUARD.lock().unwrap();
        let pool = memory_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sing-box.json");
        std::env::set_var(CONFIG_ENV_VAR, &config_path);
        tokio::fs::write(&config_path, b"previous-config").await.unwrap();

        let opts = ApplyOptions {
            config_path: config_path.clone(),
            check_cmd: Some("exit 0".to_string()),
            restart_cmd: Some("echo boom >&2; exit 1".to_string()),
            external_controller: None,
        };
        let pipeline = ApplyPipeline::new();
        let err = pipeline.reload(&pool, &opts, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code, "RT_RESTART_FAILED");

        let restored = tokio::fs::read(&config_path).await.unwrap();
        assert_eq!(restored, b"previous-config");

        let state = relaybox_store::runtime_state::load(&pool).await.unwrap();
        assert_eq!(state.config_version, 0);

        std::env::remove_var(CONFIG_ENV_VAR);
    }
}
