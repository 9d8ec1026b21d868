//! ステップ間の静的な依存関係グラフ
//!
//! # 責務
//!
//! 実行前にすべてのステップのプロンプトと `when` 条件から参照を抽出し、
//! 参照 → 依存関係のグラフを構築します。
//!
//! - 宣言順で後ろにあるステップ（または自分自身）への参照 → [`ConfigError::ForwardReference`]
//! - 存在しないステップへの参照 → [`ConfigError::UnknownStepReference`]
//! - 循環（深さ優先探索で検出） → [`ConfigError::DependencyCycle`]
//!
//! 変数（`variables.NAME` または `steps.ID.NAME`）を読むステップは、宣言順で前にある
//! その変数の書き込み元（`output = { type = "variable" }`）にも依存します。
//! 同じ変数を書き込むステップ同士も宣言順に並びます。
//! 前に書き込み元がない変数は初期変数とみなし、辺を追加しません。
//!
//! これは読み込み時の不変条件で、実行時の解決エラーとは別に検査されます。
//! 構築済みのグラフは並列実行時の準備完了判定（[`DependencyGraph::waves`]）にも使用されます。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config::step::{OutputSpec, WorkflowStep};
use crate::error::ConfigError;
use super::condition::{referenced_steps, referenced_variables};
use super::reference::{find_references, ReferenceRoot, VariableReference, DEFAULT_FIELD};

/// ステップ依存関係グラフ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    /// ステップ定義からグラフを構築し、静的な不変条件を検査する
    pub fn build(steps: &[WorkflowStep]) -> Result<Self, ConfigError> {
        let positions: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(index, step)| (step.id(), index))
            .collect();

        let mut graph = Self {
            order: steps.iter().map(|step| step.id().to_string()).collect(),
            dependencies: BTreeMap::new(),
        };

        let mut writers: HashMap<&str, Vec<&str>> = HashMap::new();

        for (index, step) in steps.iter().enumerate() {
            let mut targets: Vec<(String, String)> = Vec::new();
            let mut variables: Vec<String> = Vec::new();

            for found in find_references(step.prompt()) {
                let reference = found.reference.map_err(|e| {
                    ConfigError::Validation(format!(
                        "ステップ '{}' のプロンプトに不正な参照があります: {e}",
                        step.id()
                    ))
                })?;
                if let Some(target) = reference.step_id() {
                    targets.push((target.to_string(), found.raw.clone()));
                }
                if let Some(name) = variable_read(&reference) {
                    variables.push(name.to_string());
                }
            }
            if let Some(condition) = step.when() {
                for target in referenced_steps(condition) {
                    let raw = format!("steps.{target}");
                    targets.push((target, raw));
                }
                variables.extend(referenced_variables(condition));
            }
            let written = match step.output() {
                Some(OutputSpec::Variable { name }) => Some(name.as_str()),
                _ => None,
            };

            let entry = graph.dependencies.entry(step.id().to_string()).or_default();
            for (target, reference) in targets {
                match positions.get(target.as_str()) {
                    None => {
                        return Err(ConfigError::UnknownStepReference {
                            step_id: step.id().to_string(),
                            reference,
                        });
                    }
                    Some(&position) if position >= index => {
                        return Err(ConfigError::ForwardReference {
                            step_id: step.id().to_string(),
                            reference,
                        });
                    }
                    Some(_) => {
                        entry.insert(target);
                    }
                }
            }

            for name in variables.iter().map(String::as_str).chain(written) {
                if let Some(ids) = writers.get(name) {
                    entry.extend(ids.iter().map(|id| id.to_string()));
                }
            }
            if let Some(name) = written {
                writers.entry(name).or_default().push(step.id());
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(ConfigError::DependencyCycle(cycle));
        }

        Ok(graph)
    }

    /// 辺のリスト `(ステップ, 依存先)` から検査なしでグラフを組み立てる
    pub fn from_edges(order: &[&str], edges: &[(&str, &str)]) -> Self {
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = order
            .iter()
            .map(|id| (id.to_string(), BTreeSet::new()))
            .collect();
        for (step, dependency) in edges {
            dependencies
                .entry(step.to_string())
                .or_default()
                .insert(dependency.to_string());
        }
        Self {
            order: order.iter().map(|id| id.to_string()).collect(),
            dependencies,
        }
    }

    /// 宣言順のステップID
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// ステップが直接依存するステップID
    pub fn dependencies(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(step_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// 深さ優先探索で循環を検出する
    ///
    /// 循環がある場合は `a -> b -> a` の形のパスを返します。
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();

        for start in &self.order {
            if !marks.contains_key(start.as_str())
                && let Some(cycle) = self.visit(start, &mut marks, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Visiting);
        path.push(node);

        for dependency in self.dependencies(node) {
            match marks.get(dependency) {
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|id| *id == dependency).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|id| id.to_string()).collect();
                    cycle.push(dependency.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = self.visit(dependency, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    /// 準備完了の段階（ウェーブ）に分割する
    ///
    /// 各ウェーブのステップは、それ以前のウェーブのステップにのみ依存します。
    /// ウェーブ内の順序は宣言順を保ちます。
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut remaining: Vec<&str> = self.order.iter().map(String::as_str).collect();
        let mut finished: HashSet<&str> = HashSet::new();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.dependencies(id)
                        .all(|dep| finished.contains(dep) || !self.order.iter().any(|o| o == dep))
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            remaining.retain(|id| !ready.contains(id));
            finished.extend(ready.iter().copied());
            waves.push(ready.into_iter().map(str::to_string).collect());
        }

        waves
    }
}

/// 参照が読み取る変数名（ステップ出力そのものを読む場合は `None`）
fn variable_read(reference: &VariableReference) -> Option<&str> {
    match reference.root() {
        ReferenceRoot::Variables => reference.field(),
        ReferenceRoot::Steps => reference.field().filter(|field| *field != DEFAULT_FIELD),
    }
}
