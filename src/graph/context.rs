//! Контекст одной активации узла.
//!
//! Создается движком на каждое посещение узла и не разделяется между
//! узлами: несет текущие данные, ссылку на контекст выполнения запуска
//! и список следующих операций, собранных в ходе активации.

use super::execution::{ExecutionContext, GraphOperation};
use super::{GraphData, NodeId};
use crate::data::MiniBatchType;
use std::sync::Arc;

pub struct Context {
    node: NodeId,
    data: GraphData,
    batch_type: MiniBatchType,
    step: usize,
    execution: Arc<ExecutionContext>,
    pending: Vec<GraphOperation>,
}

impl Context {
    pub fn new(
        node: NodeId,
        data: GraphData,
        batch_type: MiniBatchType,
        step: usize,
        execution: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            node,
            data,
            batch_type,
            step,
            execution,
            pending: Vec::new(),
        }
    }

    /// Узел, которому принадлежит активация.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Входные данные текущей активации.
    pub fn data(&self) -> &GraphData {
        &self.data
    }

    /// Позиция текущего шага в последовательности.
    pub fn batch_type(&self) -> MiniBatchType {
        self.batch_type
    }

    /// Индекс временного шага в пределах батча.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Контекст выполнения запуска.
    pub fn execution(&self) -> &Arc<ExecutionContext> {
        &self.execution
    }

    /// Планирует следующую операцию обхода.
    pub fn add_next(&mut self, operation: GraphOperation) {
        self.pending.push(operation);
    }

    /// Передает собранные операции в очередь запуска.
    pub fn flush(self) {
        self.execution.enqueue_all(self.pending);
    }
}
