//! プロセス監視ループ
//!
//! # 責務
//!
//! 1つのエージェントプロセスを、終了するか強制終了されるまで一定間隔で計測し、
//! 以下の2つの条件を独立に追跡します。
//!
//! - **ハード上限超過**: メモリ使用量が上限を超えた時点で即座に停止（猶予なし）
//! - **高負荷の継続**: CPU高負荷 / メモリリーク（直近3区間の平均増加量）/ 出力の急増
//!   のいずれかが `max_high_resource_readings` 回連続したら停止。
//!   どの条件も成り立たない計測があればカウンタは 0 に戻る
//!
//! 判定ロジック [`ResourceWatchdog::observe`] は純粋関数的で、
//! 計測元（[`ProcessMetricsProvider`]）を差し替えれば決定的にテストできます。

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::config::step::ResourceOverrides;
use super::alert::{AlertKind, AlertLog, ResourceAlert};
use super::metrics::{ProcessController, ProcessMetricsProvider, ProcessSample};
use super::profile::ToolProfile;

/// 保持する計測値の数
pub const SAMPLE_HISTORY: usize = 20;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 2048;
pub const DEFAULT_CPU_WARN_PERCENT: f64 = 80.0;
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MAX_HIGH_READINGS: u32 = 6;
/// 1区間あたりのメモリ増加量の平均がこれを超えるとリークとみなす（MB）
pub const LEAK_THRESHOLD_MB: f64 = 2.0;
/// 出力増加速度の上限（bytes/s）
pub const OUTPUT_GROWTH_LIMIT: f64 = 100.0 * 1024.0;
/// リーク判定に使う区間数
const LEAK_WINDOW: usize = 3;

/// 監視設定
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogConfig {
    pub memory_limit_mb: u64,
    pub cpu_warn_percent: f64,
    pub check_interval: Duration,
    pub max_high_resource_readings: u32,
    pub leak_threshold_mb: f64,
    pub output_growth_limit: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_warn_percent: DEFAULT_CPU_WARN_PERCENT,
            check_interval: Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
            max_high_resource_readings: DEFAULT_MAX_HIGH_READINGS,
            leak_threshold_mb: LEAK_THRESHOLD_MB,
            output_growth_limit: OUTPUT_GROWTH_LIMIT,
        }
    }
}

impl WatchdogConfig {
    /// 実効設定を決める
    ///
    /// ツールプロファイルから導出した値 → 呼び出し側の指定 → 既定値 の順に採用します。
    pub fn resolve(overrides: &ResourceOverrides, profile: Option<&ToolProfile>) -> Self {
        let defaults = Self::default();
        let tuned = profile.map(ToolProfile::tune);
        let tuned_cpu = tuned.as_ref().and_then(|t| t.cpu_warn_percent);
        let tuned_memory = tuned.as_ref().and_then(|t| t.memory_limit_mb);

        Self {
            memory_limit_mb: tuned_memory
                .or(overrides.memory_limit_mb)
                .unwrap_or(defaults.memory_limit_mb),
            cpu_warn_percent: tuned_cpu
                .or(overrides.cpu_warn_percent)
                .unwrap_or(defaults.cpu_warn_percent),
            check_interval: overrides
                .check_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.check_interval),
            max_high_resource_readings: overrides
                .max_high_resource_readings
                .unwrap_or(defaults.max_high_resource_readings),
            ..defaults
        }
    }
}

/// 子プロセスの出力バイト数（読み取りタスクと監視ループで共有）
#[derive(Debug, Clone, Default)]
pub struct OutputMeter(Arc<AtomicU64>);

impl OutputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: usize) {
        self.0.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// プロセスツリーの停止を一度だけ行うスイッチ
///
/// 強制終了は最初の1回だけシグナルを送り、以降の要求は何もしません。
/// 通常停止（[`KillSwitch::stop`]）は強制終了済みでない場合にのみ終了要求を送ります。
pub struct KillSwitch {
    pid: u32,
    controller: Arc<dyn ProcessController>,
    killed: AtomicBool,
    stopped: AtomicBool,
    reason: Mutex<Option<ResourceAlert>>,
    /// 計測時点で観測した子孫のPID
    descendants: Mutex<BTreeSet<u32>>,
}

impl KillSwitch {
    pub fn new(pid: u32, controller: Arc<dyn ProcessController>) -> Self {
        Self {
            pid,
            controller,
            killed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            reason: Mutex::new(None),
            descendants: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// 強制終了する。最初の呼び出しのときだけ `true`
    pub fn kill(&self, reason: Option<ResourceAlert>) -> bool {
        if self.killed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(alert) = reason
            && let Ok(mut slot) = self.reason.lock()
        {
            *slot = Some(alert);
        }
        warn!(pid = self.pid, "プロセスツリーを強制終了します");
        self.controller.kill_tree(self.pid);
        true
    }

    /// 通常停止（強制終了済みなら何もしない）
    pub fn stop(&self) {
        if self.killed.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pid = self.pid, "プロセスツリーに終了を要求します");
        self.controller.terminate_tree(self.pid);
    }

    /// 現在の子孫PIDを記録に加える
    ///
    /// 親が終了すると子孫は親子関係から辿れなくなるため、生存中に記録しておきます。
    pub fn remember_descendants(&self) {
        let found = self.controller.descendants(self.pid);
        if found.is_empty() {
            return;
        }
        if let Ok(mut known) = self.descendants.lock() {
            known.extend(found);
        }
    }

    /// 記録済みの子孫を個別に強制終了し、停止できた数を返す
    pub fn kill_descendants(&self) -> usize {
        let known = match self.descendants.lock() {
            Ok(mut known) => std::mem::take(&mut *known),
            Err(_) => return 0,
        };
        let killed = known.into_iter().filter(|&pid| self.controller.kill_process(pid)).count();
        if killed > 0 {
            warn!(pid = self.pid, killed, "親プロセスの終了後に残った子孫を停止しました");
        }
        killed
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// 強制終了の原因となったアラート
    pub fn reason(&self) -> Option<ResourceAlert> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }
}

/// 高負荷と判定された理由
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HighResourceSignal {
    /// CPU使用率（%）
    Cpu(f64),
    /// 1区間あたりの平均メモリ増加量（MB）
    MemoryLeak(f64),
    /// 出力の増加速度（bytes/s）
    OutputGrowth(f64),
}

/// 1回の計測に対する判定
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Normal,
    /// 高負荷が続いている（連続回数）
    Elevated {
        readings: u32,
        signals: Vec<HighResourceSignal>,
    },
    /// 停止すべき
    Breach(ResourceAlert),
}

/// 監視の結果
#[derive(Debug, Clone, Default)]
pub struct WatchdogReport {
    pub alerts: Vec<ResourceAlert>,
    pub killed: bool,
    pub samples_taken: usize,
    pub peak_memory_mb: f64,
}

/// 1プロセス分のリソース監視
pub struct ResourceWatchdog {
    step_id: String,
    pid: u32,
    config: WatchdogConfig,
    metrics: Box<dyn ProcessMetricsProvider>,
    kill_switch: Arc<KillSwitch>,
    output: OutputMeter,
    alert_log: Option<AlertLog>,
    samples: VecDeque<ProcessSample>,
    high_readings: u32,
    last_output_len: u64,
    samples_taken: usize,
    peak_memory_mb: f64,
    alerts: Vec<ResourceAlert>,
}

impl ResourceWatchdog {
    pub fn new(
        step_id: impl Into<String>,
        config: WatchdogConfig,
        metrics: Box<dyn ProcessMetricsProvider>,
        kill_switch: Arc<KillSwitch>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            pid: kill_switch.pid(),
            config,
            metrics,
            kill_switch,
            output: OutputMeter::new(),
            alert_log: None,
            samples: VecDeque::with_capacity(SAMPLE_HISTORY),
            high_readings: 0,
            last_output_len: 0,
            samples_taken: 0,
            peak_memory_mb: 0.0,
            alerts: Vec::new(),
        }
    }

    /// 出力増加量の計測元を設定する
    pub fn with_output_meter(mut self, meter: OutputMeter) -> Self {
        self.output = meter;
        self
    }

    /// アラートの書き出し先を設定する
    pub fn with_alert_log(mut self, log: AlertLog) -> Self {
        self.alert_log = Some(log);
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// 直近の計測値（最大 [`SAMPLE_HISTORY`] 件）
    pub fn samples(&self) -> &VecDeque<ProcessSample> {
        &self.samples
    }

    /// 1回分の計測値を判定する
    pub fn observe(&mut self, sample: ProcessSample, output_len: u64) -> Verdict {
        if self.samples.len() == SAMPLE_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.samples_taken += 1;
        self.peak_memory_mb = self.peak_memory_mb.max(sample.memory_mb);

        let memory_limit = self.config.memory_limit_mb as f64;
        if sample.memory_mb > memory_limit {
            self.high_readings = 0;
            return Verdict::Breach(self.alert(
                AlertKind::Memory,
                sample.memory_mb,
                memory_limit,
                "MB",
                format!(
                    "メモリ使用量 {:.1}MB が上限 {}MB を超えました",
                    sample.memory_mb, self.config.memory_limit_mb
                ),
            ));
        }

        let mut signals = Vec::new();
        if sample.cpu_percent > self.config.cpu_warn_percent {
            signals.push(HighResourceSignal::Cpu(sample.cpu_percent));
        }
        if let Some(growth) = self.average_memory_growth()
            && growth > self.config.leak_threshold_mb
        {
            signals.push(HighResourceSignal::MemoryLeak(growth));
        }
        let output_rate = self.output_rate(output_len);
        if output_rate > self.config.output_growth_limit {
            signals.push(HighResourceSignal::OutputGrowth(output_rate));
        }

        if signals.is_empty() {
            self.high_readings = 0;
            return Verdict::Normal;
        }

        self.high_readings += 1;
        if self.high_readings < self.config.max_high_resource_readings {
            return Verdict::Elevated {
                readings: self.high_readings,
                signals,
            };
        }

        let readings = self.high_readings;
        self.high_readings = 0;
        let alert = match signals[0] {
            HighResourceSignal::Cpu(cpu) => self.alert(
                AlertKind::Cpu,
                cpu,
                self.config.cpu_warn_percent,
                "%",
                format!(
                    "CPU使用率 {cpu:.1}% が {readings} 回連続で警告閾値 {}% を超えました",
                    self.config.cpu_warn_percent
                ),
            ),
            HighResourceSignal::MemoryLeak(growth) => self.alert(
                AlertKind::Memory,
                growth,
                self.config.leak_threshold_mb,
                "MB/interval",
                format!(
                    "メモリが {readings} 回連続で平均 {growth:.1}MB ずつ増加しています（リークの疑い）"
                ),
            ),
            HighResourceSignal::OutputGrowth(rate) => self.alert(
                AlertKind::ProcessKilled,
                rate,
                self.config.output_growth_limit,
                "bytes/s",
                format!(
                    "出力が {readings} 回連続で {:.0}KB/s の速度で増加しています（暴走の疑い）",
                    rate / 1024.0
                ),
            ),
        };
        Verdict::Breach(alert)
    }

    /// プロセスが終了するか停止されるまで監視する
    pub async fn run(self) -> WatchdogReport {
        self.run_until(std::future::pending()).await
    }

    /// [`run`](Self::run) と同じだが、`exited` が完了した時点でも監視を終える
    pub async fn run_until<F>(mut self, exited: F) -> WatchdogReport
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 最初の tick は即座に完了するため、1区間待ってから計測を始める
        ticker.tick().await;
        tokio::pin!(exited);

        loop {
            tokio::select! {
                _ = &mut exited => {
                    debug!(step_id = %self.step_id, pid = self.pid, "終了通知を受けたため監視を終了します");
                    break;
                }
                _ = ticker.tick() => {}
            }
            if self.kill_switch.is_killed() {
                debug!(step_id = %self.step_id, pid = self.pid, "他の要因で停止済みのため監視を終了します");
                break;
            }

            let Some(sample) = self.metrics.sample(self.pid) else {
                debug!(step_id = %self.step_id, pid = self.pid, "プロセスが終了したため監視を終了します");
                break;
            };
            self.kill_switch.remember_descendants();

            match self.observe(sample, self.output.len()) {
                Verdict::Normal => {}
                Verdict::Elevated { readings, signals } => {
                    debug!(
                        step_id = %self.step_id,
                        pid = self.pid,
                        readings,
                        ?signals,
                        "高負荷が継続しています"
                    );
                }
                Verdict::Breach(alert) => {
                    error!(
                        step_id = %self.step_id,
                        pid = self.pid,
                        kind = ?alert.kind,
                        value = alert.value,
                        limit = alert.limit,
                        "{}",
                        alert.message
                    );
                    self.kill_switch.kill(Some(alert.clone()));
                    self.record(alert).await;
                    break;
                }
            }
        }

        WatchdogReport {
            alerts: self.alerts,
            killed: self.kill_switch.is_killed(),
            samples_taken: self.samples_taken,
            peak_memory_mb: self.peak_memory_mb,
        }
    }

    async fn record(&mut self, alert: ResourceAlert) {
        if let Some(log) = &self.alert_log
            && let Err(e) = log.append(&alert).await
        {
            warn!(step_id = %self.step_id, error = %e, "アラートの保存に失敗しました");
        }
        self.alerts.push(alert);
    }

    fn alert(
        &self,
        kind: AlertKind,
        value: f64,
        limit: f64,
        unit: &str,
        message: String,
    ) -> ResourceAlert {
        ResourceAlert::new(&self.step_id, kind, value, limit, unit, message, self.pid)
    }

    /// 直近 [`LEAK_WINDOW`] 区間のメモリ増加量の平均
    fn average_memory_growth(&self) -> Option<f64> {
        if self.samples.len() <= LEAK_WINDOW {
            return None;
        }
        let recent: Vec<f64> = self
            .samples
            .iter()
            .skip(self.samples.len() - LEAK_WINDOW - 1)
            .map(|s| s.memory_mb)
            .collect();
        let total: f64 = recent.windows(2).map(|pair| pair[1] - pair[0]).sum();
        Some(total / LEAK_WINDOW as f64)
    }

    fn output_rate(&mut self, output_len: u64) -> f64 {
        let growth = output_len.saturating_sub(self.last_output_len);
        self.last_output_len = output_len;
        let seconds = self.config.check_interval.as_secs_f64();
        if seconds > 0.0 {
            growth as f64 / seconds
        } else {
            0.0
        }
    }
}
