//! 本轮对外事件：流式文本、Trajectory、引用与终态（可序列化为 JSON 供前端展示）

use serde::Serialize;

use crate::citation::Citation;

/// 一条面向用户的执行进度
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrajectoryEvent {
    pub title: String,
    pub content: String,
    /// 关联的 Step 序号（初始化、拒绝等事件可能没有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
}

/// 本轮终态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnStatus {
    Success { steps: usize, citations: usize },
    Aborted { reason: String },
}

impl TurnStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TurnStatus::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 最终回答的一段干净文本（已去除引用标记）
    TextDelta { text: String },
    Trajectory(TrajectoryEvent),
    /// 新解析出的引用
    Citations { citations: Vec<Citation> },
    /// 终态，每轮恰好一次且是最后一个事件
    Status { status: TurnStatus },
}
