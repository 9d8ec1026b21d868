//! OSのプロセスメトリクス取得とシグナル送信
//!
//! # 責務
//!
//! - [`ProcessMetricsProvider`]: プロセス（とその子孫）のメモリ・CPU使用率を取得
//! - [`ProcessController`]: プロセスツリーへの強制終了/終了要求と、子孫PIDの列挙
//!
//! 本番実装は `sysinfo` を使う [`SysinfoMetrics`] / [`SysinfoController`] で、
//! テストでは決定的な偽実装に差し替えます。
//!
//! エージェントCLIは子プロセス（node, シェル等）を生成するため、
//! 計測もシグナル送信も起動したプロセスを根とするツリー全体に対して行います。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

/// 1回分の計測値
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    /// 監視対象のプロセスID
    pub pid: u32,
    /// メモリ使用量（MB、プロセスツリー合計）
    pub memory_mb: f64,
    /// CPU使用率（%、プロセスツリー合計）
    pub cpu_percent: f64,
}

/// プロセスメトリクスの取得元
pub trait ProcessMetricsProvider: Send {
    /// プロセスを計測する。プロセスが終了していれば `None`
    fn sample(&mut self, pid: u32) -> Option<ProcessSample>;
}

/// プロセスへのシグナル送信
pub trait ProcessController: Send + Sync {
    /// プロセスツリー全体を強制終了（SIGKILL 相当）
    fn kill_tree(&self, pid: u32) -> bool;

    /// プロセスツリー全体に終了を要求（SIGTERM 相当）
    fn terminate_tree(&self, pid: u32) -> bool;

    /// `pid` の現在の子孫（`pid` 自身は含まない）
    fn descendants(&self, _pid: u32) -> Vec<u32> {
        Vec::new()
    }

    /// 単一のプロセスを強制終了する
    fn kill_process(&self, _pid: u32) -> bool {
        false
    }
}

/// `sysinfo` による計測
pub struct SysinfoMetrics {
    system: System,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMetricsProvider for SysinfoMetrics {
    fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let root = Pid::from_u32(pid);
        let process = self.system.process(root)?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return None;
        }

        let (memory_bytes, cpu_percent) = process_tree(&self.system, root)
            .into_iter()
            .filter_map(|pid| self.system.process(pid))
            .fold((0u64, 0f64), |(memory, cpu), process| {
                (memory + process.memory(), cpu + f64::from(process.cpu_usage()))
            });

        Some(ProcessSample {
            pid,
            memory_mb: memory_bytes as f64 / 1024.0 / 1024.0,
            cpu_percent,
        })
    }
}

/// `sysinfo` によるシグナル送信
pub struct SysinfoController {
    system: Mutex<System>,
}

impl SysinfoController {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn signal_tree(&self, pid: u32, signal: Signal) -> bool {
        let Ok(mut system) = self.system.lock() else {
            warn!(pid, "プロセステーブルのロックに失敗しました");
            return false;
        };
        system.refresh_processes(ProcessesToUpdate::All, true);

        let root = Pid::from_u32(pid);
        if system.process(root).is_none() {
            debug!(pid, ?signal, "対象プロセスは既に終了しています");
            return false;
        }

        // 親から先に止めて、子の再生成を防ぐ
        let mut signalled = false;
        for target in process_tree(&system, root) {
            if let Some(process) = system.process(target) {
                let sent = process
                    .kill_with(signal)
                    .unwrap_or_else(|| process.kill());
                if target == root {
                    signalled = sent;
                }
            }
        }
        debug!(pid, ?signal, signalled, "プロセスツリーにシグナルを送信しました");
        signalled
    }
}

impl Default for SysinfoController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController for SysinfoController {
    fn kill_tree(&self, pid: u32) -> bool {
        self.signal_tree(pid, Signal::Kill)
    }

    fn terminate_tree(&self, pid: u32) -> bool {
        self.signal_tree(pid, Signal::Term)
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        let Ok(mut system) = self.system.lock() else {
            return Vec::new();
        };
        system.refresh_processes(ProcessesToUpdate::All, true);

        let root = Pid::from_u32(pid);
        if system.process(root).is_none() {
            return Vec::new();
        }
        process_tree(&system, root)
            .into_iter()
            .skip(1)
            .map(|pid| pid.as_u32())
            .collect()
    }

    fn kill_process(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        let target = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system
            .process(target)
            .is_some_and(|process| process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill()))
    }
}

/// 起動時に選択されるプラットフォーム既定の計測実装
pub fn default_metrics_provider() -> Box<dyn ProcessMetricsProvider> {
    Box::new(SysinfoMetrics::new())
}

/// 起動時に選択されるプラットフォーム既定のシグナル送信実装
pub fn default_process_controller() -> Arc<dyn ProcessController> {
    Arc::new(SysinfoController::new())
}

/// `root` とその子孫のPIDを幅優先で列挙（`root` が先頭）
fn process_tree(system: &System, root: Pid) -> Vec<Pid> {
    let mut tree = vec![root];
    let mut queue = VecDeque::from([root]);

    while let Some(parent) = queue.pop_front() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !tree.contains(pid) {
                tree.push(*pid);
                queue.push_back(*pid);
            }
        }
    }

    tree
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_current_process() {
        let mut metrics = SysinfoMetrics::new();
        let sample = metrics.sample(std::process::id()).expect("自プロセスは計測できる");
        assert_eq!(sample.pid, std::process::id());
        assert!(sample.memory_mb > 0.0);
    }

    #[test]
    fn test_sample_missing_process() {
        let mut metrics = SysinfoMetrics::new();
        assert!(metrics.sample(u32::MAX - 1).is_none());
    }

    #[test]
    fn test_signal_missing_process_is_noop() {
        let controller = SysinfoController::new();
        assert!(!controller.kill_tree(u32::MAX - 1));
        assert!(!controller.terminate_tree(u32::MAX - 1));
        assert!(!controller.kill_process(u32::MAX - 1));
        assert!(controller.descendants(u32::MAX - 1).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_descendants_lists_children() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let controller = SysinfoController::new();

        let found = controller.descendants(std::process::id());
        assert!(found.contains(&child.id()), "{found:?}");
        assert!(!found.contains(&std::process::id()));

        assert!(controller.kill_process(child.id()));
        child.wait().expect("wait sleep");
    }
}
