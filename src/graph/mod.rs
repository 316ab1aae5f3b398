//! Ядро графа исполнения.
//!
//! Здесь живут общие типы движка: идентификаторы узлов, носитель данных
//! [`GraphData`] и таксономия ошибок. Сам граф и обход — в [`engine`],
//! состояние запуска — в [`execution`] и [`learning`].

pub mod backprop;
pub mod context;
pub mod engine;
pub mod execution;
pub mod learning;
pub mod node;

pub use backprop::Backpropagation;
pub use context::Context;
pub use engine::{Engine, ForwardTrace, Graph};
pub use execution::{ExecutionContext, GraphOperation};
pub use learning::{LearningConfig, LearningContext};
pub use node::{DenseParams, Node, NodeOp, RecurrentParams};

use crate::linalg::Matrix;
use thiserror::Error;

/// Идентификатор узла в графе.
pub type NodeId = usize;

pub type GraphResult<T> = Result<T, GraphError>;

/// Ошибки движка исполнения графа.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Узел с ID {0} не найден")]
    NodeNotFound(NodeId),
    #[error("Узел с именем '{0}' не найден")]
    NodeNameNotFound(String),
    #[error("У графа не задан входной узел")]
    MissingInput,
    #[error("Нарушено предусловие: {0}")]
    Precondition(String),
    #[error("Операция не поддерживается: {0}")]
    Unsupported(String),
    #[error("Ошибка данных: {0}")]
    Data(#[from] crate::data::DataError),
}

/// Непрозрачный носитель тензорных данных между узлами графа.
///
/// Либо одиночная матрица, либо упорядоченная последовательность матриц
/// (по одной на временной шаг). Разложение без потерь:
/// `compose(decompose(x))` воспроизводит `x`.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphData {
    Single(Matrix),
    Sequence(Vec<Matrix>),
}

impl GraphData {
    /// Раскладывает носитель в упорядоченный список матриц.
    pub fn decompose(&self) -> Vec<Matrix> {
        match self {
            GraphData::Single(m) => vec![m.clone()],
            GraphData::Sequence(list) => list.clone(),
        }
    }

    /// Собирает носитель из списка матриц. Список из одного элемента
    /// становится одиночной матрицей.
    pub fn compose(mut list: Vec<Matrix>) -> GraphData {
        if list.len() == 1 {
            GraphData::Single(list.remove(0))
        } else {
            GraphData::Sequence(list)
        }
    }

    /// Первая (или единственная) матрица носителя.
    pub fn matrix(&self) -> &Matrix {
        match self {
            GraphData::Single(m) => m,
            GraphData::Sequence(list) => &list[0],
        }
    }

    /// Количество матриц в носителе.
    pub fn depth(&self) -> usize {
        match self {
            GraphData::Single(_) => 1,
            GraphData::Sequence(list) => list.len(),
        }
    }
}

impl From<Matrix> for GraphData {
    fn from(m: Matrix) -> Self {
        GraphData::Single(m)
    }
}
