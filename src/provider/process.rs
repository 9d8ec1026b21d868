//! 監視下でのエージェントプロセス起動
//!
//! # 責務
//!
//! - CLIを子プロセスとして起動し、標準出力を1行ずつ読み取る
//! - 読み取った出力量を [`OutputMeter`] に加算し、[`ResourceWatchdog`] と並行に監視する
//! - 出力中のツール呼び出しを [`LoopDetector`] に通し、ループが続けばプロセスを停止する
//! - 実行中の Future が破棄された場合（タイムアウト等）はプロセスツリーを強制終了する
//! - 親プロセスの終了後も子孫が出力を握り続ける場合は、猶予の後に子孫を止めて読み取りを打ち切る
//!
//! # 処理の流れ
//!
//! ```text
//! spawn ─┬─ stdout / stderr 読み取り（出力量計測・ループ検出）
//!        ├─ child.wait()
//!        │    └─ 先に終了したら、猶予内に EOF が来なければ記録済みの子孫を強制終了
//!        └─ ResourceWatchdog（別タスク、終了通知まで計測し、子孫PIDを記録）
//! ```

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::detector::LoopDetector;
use crate::error::ProviderError;
use crate::watchdog::{
    default_metrics_provider, default_process_controller, AlertKind, AlertLog, KillSwitch, OutputMeter,
    ProcessController, ProcessMetricsProvider, ResourceAlert, ResourceWatchdog, WatchdogConfig,
};
use super::traits::ProcessStats;

/// ループ検出がこの回数連続したらプロセスを停止する
pub const LOOP_KILL_THRESHOLD: usize = 3;

/// 親プロセスの終了後、出力が閉じられるのを待つ時間
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// 出力1行から抽出したツール呼び出し
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

/// 出力1行からツール呼び出しを取り出す関数
pub type ToolCallExtractor = fn(&str) -> Vec<ToolCall>;

/// 起動するコマンド
#[derive(Debug, Clone)]
pub struct AgentInvocation<'a> {
    pub step_id: &'a str,
    pub program: &'a str,
    /// 見つからない場合の案内に使うパッケージ名
    pub package: &'a str,
    pub args: Vec<String>,
    pub workdir: Option<&'a Path>,
    pub watchdog: &'a WatchdogConfig,
    pub alert_log: Option<&'a AlertLog>,
    pub extract_tool_calls: ToolCallExtractor,
}

/// 正常終了したプロセスの出力
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub stats: ProcessStats,
}

type MetricsFactory = Arc<dyn Fn() -> Box<dyn ProcessMetricsProvider> + Send + Sync>;

/// 監視付きでプロセスを起動する
#[derive(Clone)]
pub struct ProcessSupervisor {
    controller: Arc<dyn ProcessController>,
    metrics: MetricsFactory,
    loop_window: usize,
    drain_grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(default_process_controller(), Arc::new(default_metrics_provider))
    }
}

impl ProcessSupervisor {
    pub fn new(controller: Arc<dyn ProcessController>, metrics: MetricsFactory) -> Self {
        Self {
            controller,
            metrics,
            loop_window: crate::detector::loop_detector::DEFAULT_WINDOW,
            drain_grace: DRAIN_GRACE,
        }
    }

    /// プロセスを起動し、終了（または強制終了）まで監視する
    pub async fn run(&self, invocation: AgentInvocation<'_>) -> Result<ProcessOutput, ProviderError> {
        let mut command = Command::new(invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = invocation.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::CliNotFound(invocation.program.to_string(), invocation.package.to_string())
            } else {
                ProviderError::Io(e)
            }
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ProviderError::CliExecutionError("起動直後にプロセスが終了しました".to_string()))?;
        info!(step_id = invocation.step_id, pid, program = invocation.program, "エージェントを起動しました");

        let kill_switch = Arc::new(KillSwitch::new(pid, self.controller.clone()));
        let mut guard = KillOnDrop::new(kill_switch.clone());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::CliExecutionError("stdout を取得できません".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::CliExecutionError("stderr を取得できません".to_string()))?;

        let meter = OutputMeter::new();
        let mut watchdog = ResourceWatchdog::new(
            invocation.step_id,
            invocation.watchdog.clone(),
            (self.metrics)(),
            kill_switch.clone(),
        )
        .with_output_meter(meter.clone());
        if let Some(log) = invocation.alert_log {
            watchdog = watchdog.with_alert_log(log.clone());
        }
        let (exited_tx, exited_rx) = oneshot::channel::<()>();
        let watchdog_task = tokio::spawn(watchdog.run_until(async move {
            let _ = exited_rx.await;
        }));

        let mut reader = StdoutReader {
            step_id: invocation.step_id,
            pid,
            meter,
            kill_switch: kill_switch.clone(),
            detector: LoopDetector::new(self.loop_window),
            extract: invocation.extract_tool_calls,
            alert_log: invocation.alert_log,
            output: String::new(),
            tool_calls: 0,
        };
        let mut stderr_bytes = Vec::new();

        let (status, read_result) = {
            let drain = async {
                let (read_result, ()) = tokio::join!(reader.read(stdout), read_all(stderr, &mut stderr_bytes));
                read_result
            };
            tokio::pin!(drain);

            tokio::select! {
                read_result = &mut drain => (child.wait().await, read_result),
                status = child.wait() => {
                    let read_result = match tokio::time::timeout(self.drain_grace, &mut drain).await {
                        Ok(read_result) => read_result,
                        Err(_) => {
                            kill_switch.kill_descendants();
                            tokio::time::timeout(self.drain_grace, &mut drain)
                                .await
                                .unwrap_or_else(|_| {
                                    warn!(
                                        step_id = invocation.step_id,
                                        pid,
                                        "親プロセスの終了後も出力が閉じられないため読み取りを打ち切ります"
                                    );
                                    Ok(())
                                })
                        }
                    };
                    (status, read_result)
                }
            }
        };
        guard.disarm();
        let _ = exited_tx.send(());

        let report = watchdog_task.await.unwrap_or_default();
        kill_switch.stop();

        let status = status?;
        read_result?;
        let stdout_text = reader.output;
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();
        let stats = ProcessStats {
            pid,
            peak_memory_mb: report.peak_memory_mb,
            tool_calls: reader.tool_calls,
        };

        if kill_switch.is_killed() {
            let alert = kill_switch.reason().unwrap_or_else(|| {
                ResourceAlert::new(
                    invocation.step_id,
                    AlertKind::ProcessKilled,
                    0.0,
                    0.0,
                    "",
                    "プロセスが強制終了されました",
                    pid,
                )
            });
            return Err(ProviderError::ResourceLimit(Box::new(alert)));
        }

        if !status.success() {
            return Err(classify_failure(invocation.program, status.code(), &stderr_text));
        }

        debug!(step_id = invocation.step_id, pid, bytes = stdout_text.len(), "エージェントが終了しました");
        Ok(ProcessOutput {
            stdout: stdout_text,
            stderr: stderr_text,
            stats,
        })
    }
}

/// 異常終了時の stderr から原因を分類する
pub fn classify_failure(program: &str, code: Option<i32>, stderr: &str) -> ProviderError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("please run /login")
    {
        return ProviderError::AuthenticationError(stderr.trim().to_string(), program.to_string());
    }
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
        return ProviderError::RateLimitExceeded;
    }
    ProviderError::NonZeroExit {
        code,
        stderr: stderr.trim().to_string(),
    }
}

/// 破棄されたら（正常終了を確認していなければ）プロセスツリーを強制終了する
struct KillOnDrop {
    kill_switch: Arc<KillSwitch>,
    armed: bool,
}

impl KillOnDrop {
    fn new(kill_switch: Arc<KillSwitch>) -> Self {
        Self {
            kill_switch,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if self.armed {
            warn!(pid = self.kill_switch.pid(), "実行が中断されたためプロセスツリーを停止します");
            self.kill_switch.kill(None);
        }
    }
}

struct StdoutReader<'a> {
    step_id: &'a str,
    pid: u32,
    meter: OutputMeter,
    kill_switch: Arc<KillSwitch>,
    detector: LoopDetector,
    extract: ToolCallExtractor,
    alert_log: Option<&'a AlertLog>,
    output: String,
    tool_calls: usize,
}

impl StdoutReader<'_> {
    /// EOF まで読み、出力テキストとツール呼び出し数を蓄積する
    ///
    /// 途中で打ち切られても、それまでに読んだ行は `output` に残ります。
    async fn read(&mut self, stdout: impl AsyncRead + Unpin) -> Result<(), ProviderError> {
        let mut reader = BufReader::new(stdout);
        let mut buffer = Vec::new();
        let mut consecutive_loops = 0;

        loop {
            buffer.clear();
            let read = reader.read_until(b'\n', &mut buffer).await?;
            if read == 0 {
                break;
            }
            self.meter.add(read);
            let line = String::from_utf8_lossy(&buffer);
            self.output.push_str(&line);

            if self.kill_switch.is_killed() {
                continue;
            }
            for call in (self.extract)(line.trim_end()) {
                self.tool_calls += 1;
                if self.detector.check_for_loop(&call.name, &call.args) {
                    consecutive_loops += 1;
                    debug!(step_id = self.step_id, tool = %call.name, consecutive_loops, "同じツール呼び出しを検出しました");
                } else {
                    consecutive_loops = 0;
                }

                if consecutive_loops >= LOOP_KILL_THRESHOLD {
                    let alert = ResourceAlert::new(
                        self.step_id,
                        AlertKind::ProcessKilled,
                        consecutive_loops as f64,
                        LOOP_KILL_THRESHOLD as f64,
                        "repeats",
                        format!(
                            "ツール '{}' が同じ引数で繰り返し呼び出されたため停止しました",
                            call.name
                        ),
                        self.pid,
                    );
                    warn!(step_id = self.step_id, pid = self.pid, tool = %call.name, "{}", alert.message);
                    if let Some(log) = self.alert_log
                        && let Err(e) = log.append(&alert).await
                    {
                        warn!(step_id = self.step_id, error = %e, "アラートの保存に失敗しました");
                    }
                    self.kill_switch.kill(Some(alert));
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn read_all(mut stream: impl AsyncRead + Unpin, bytes: &mut Vec<u8>) {
    if let Err(e) = stream.read_to_end(bytes).await {
        warn!(error = %e, "stderr の読み取りに失敗しました");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

    use crate::watchdog::ProcessSample;
    use crate::watchdog::metrics::SysinfoController;

    #[derive(Default)]
    struct CountingController {
        kills: AtomicUsize,
        killed_pids: Mutex<Vec<u32>>,
        /// 実際にシグナルを送る場合の委譲先
        inner: Option<SysinfoController>,
    }

    impl CountingController {
        fn delegating() -> Self {
            Self {
                inner: Some(SysinfoController::new()),
                ..Default::default()
            }
        }
    }

    impl ProcessController for CountingController {
        fn kill_tree(&self, pid: u32) -> bool {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.inner.as_ref().is_none_or(|inner| inner.kill_tree(pid))
        }

        fn terminate_tree(&self, pid: u32) -> bool {
            self.inner.as_ref().is_none_or(|inner| inner.terminate_tree(pid))
        }

        fn descendants(&self, pid: u32) -> Vec<u32> {
            self.inner.as_ref().map(|inner| inner.descendants(pid)).unwrap_or_default()
        }

        fn kill_process(&self, pid: u32) -> bool {
            self.killed_pids.lock().unwrap().push(pid);
            self.inner.as_ref().is_some_and(|inner| inner.kill_process(pid))
        }
    }

    struct ExitedMetrics;

    impl ProcessMetricsProvider for ExitedMetrics {
        fn sample(&mut self, _pid: u32) -> Option<ProcessSample> {
            None
        }
    }

    /// 常に軽負荷を返す計測（監視ループを回し続ける）
    struct IdleMetrics;

    impl ProcessMetricsProvider for IdleMetrics {
        fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
            Some(ProcessSample {
                pid,
                memory_mb: 1.0,
                cpu_percent: 0.0,
            })
        }
    }

    /// プロセスが消える（またはゾンビになる）まで最大1秒待つ
    async fn wait_until_gone(pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        let mut system = System::new();
        for _ in 0..50 {
            system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
            match system.process(target) {
                None => return true,
                Some(process) if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) => {
                    return true;
                }
                Some(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        false
    }

    fn read_pid(path: &Path) -> u32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    fn no_tools(_line: &str) -> Vec<ToolCall> {
        Vec::new()
    }

    fn every_line_is_same_call(_line: &str) -> Vec<ToolCall> {
        vec![ToolCall {
            name: "Bash".to_string(),
            args: serde_json::json!({"command": "ls"}),
        }]
    }

    fn supervisor() -> (ProcessSupervisor, Arc<CountingController>) {
        let controller = Arc::new(CountingController::default());
        let supervisor = ProcessSupervisor::new(controller.clone(), Arc::new(|| {
            Box::new(ExitedMetrics) as Box<dyn ProcessMetricsProvider>
        }));
        (supervisor, controller)
    }

    fn invocation<'a>(program: &'a str, args: &[&str], config: &'a WatchdogConfig, extract: ToolCallExtractor) -> AgentInvocation<'a> {
        AgentInvocation {
            step_id: "test",
            program,
            package: "test-package",
            args: args.iter().map(|s| s.to_string()).collect(),
            workdir: None,
            watchdog: config,
            alert_log: None,
            extract_tool_calls: extract,
        }
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("claude", Some(1), "Invalid API key"),
            ProviderError::AuthenticationError(_, _)
        ));
        assert!(matches!(
            classify_failure("claude", Some(1), "HTTP 429 Too Many Requests"),
            ProviderError::RateLimitExceeded
        ));
        assert!(matches!(
            classify_failure("claude", Some(2), "boom"),
            ProviderError::NonZeroExit { code: Some(2), .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let (supervisor, controller) = supervisor();
        let config = WatchdogConfig::default();
        let output = supervisor
            .run(invocation("sh", &["-c", "echo hello; echo world"], &config, no_tools))
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello\nworld\n");
        assert_eq!(controller.kills.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_non_zero_exit() {
        let (supervisor, _) = supervisor();
        let config = WatchdogConfig::default();
        let err = supervisor
            .run(invocation("sh", &["-c", "echo oops >&2; exit 3"], &config, no_tools))
            .await
            .unwrap_err();
        match err {
            ProviderError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_repeated_tool_calls_kill_process() {
        let (supervisor, controller) = supervisor();
        let config = WatchdogConfig::default();
        let err = supervisor
            .run(invocation(
                "sh",
                &["-c", "for i in 1 2 3 4 5; do echo call; done"],
                &config,
                every_line_is_same_call,
            ))
            .await
            .unwrap_err();
        match err {
            ProviderError::ResourceLimit(alert) => assert_eq!(alert.kind, AlertKind::ProcessKilled),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(controller.kills.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_run_kills_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pidfile.display());
        let controller = Arc::new(CountingController::delegating());
        let supervisor = ProcessSupervisor::new(controller.clone(), Arc::new(|| {
            Box::new(ExitedMetrics) as Box<dyn ProcessMetricsProvider>
        }));
        let config = WatchdogConfig::default();

        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            supervisor.run(invocation("sh", &["-c", script.as_str()], &config, no_tools)),
        )
        .await;

        assert!(outcome.is_err(), "タイムアウトしていません: {outcome:?}");
        assert_eq!(controller.kills.load(Ordering::SeqCst), 1);
        let grandchild = read_pid(&pidfile);
        assert!(wait_until_gone(grandchild).await, "孫プロセス {grandchild} が残っています");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_root_does_not_wait_for_background_child() {
        let (mut supervisor, _) = supervisor();
        supervisor.drain_grace = Duration::from_millis(100);
        let config = WatchdogConfig::default();

        let output = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.run(invocation("sh", &["-c", "sleep 30 & echo started"], &config, no_tools)),
        )
        .await
        .expect("親の終了後も読み取りが続いています")
        .unwrap();

        assert_eq!(output.stdout, "started\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_root_kills_remembered_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > '{}'; echo started; sleep 0.3", pidfile.display());
        let controller = Arc::new(CountingController::delegating());
        let mut supervisor = ProcessSupervisor::new(controller.clone(), Arc::new(|| {
            Box::new(IdleMetrics) as Box<dyn ProcessMetricsProvider>
        }));
        supervisor.drain_grace = Duration::from_millis(100);
        let config = WatchdogConfig {
            check_interval: Duration::from_millis(20),
            ..Default::default()
        };

        let output = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.run(invocation("sh", &["-c", script.as_str()], &config, no_tools)),
        )
        .await
        .expect("親の終了後も読み取りが続いています")
        .unwrap();

        assert_eq!(output.stdout, "started\n");
        let background = read_pid(&pidfile);
        assert!(controller.killed_pids.lock().unwrap().contains(&background));
        assert!(wait_until_gone(background).await, "子孫プロセス {background} が残っています");
        assert_eq!(controller.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let (supervisor, _) = supervisor();
        let config = WatchdogConfig::default();
        let err = supervisor
            .run(invocation("nonexistent-command-xyz123", &[], &config, no_tools))
            .await
            .unwrap_err();
        match err {
            ProviderError::CliNotFound(cmd, pkg) => {
                assert_eq!(cmd, "nonexistent-command-xyz123");
                assert_eq!(pkg, "test-package");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
