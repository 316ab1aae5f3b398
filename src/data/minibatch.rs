//! MiniBatch — один батч строк, подготовленный для прохода по графу.
//!
//! Для последовательных данных батч хранит по одной матрице на временной
//! шаг (timestep-major): строки матрицы шага `t` — это `t`-е срезы всех
//! выбранных последовательностей. Каждый шаг помечен позицией в
//! последовательности.

use crate::linalg::Matrix;
use serde::{Deserialize, Serialize};

/// Позиция временного шага внутри последовательности.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiniBatchType {
    /// Первый шаг последовательности (для глубины 1 — единственный).
    SequenceStart,
    /// Промежуточный шаг.
    Standard,
    /// Последний шаг последовательности.
    SequenceEnd,
}

/// Один временной шаг батча.
#[derive(Debug, Clone)]
pub struct MiniBatchStep {
    pub batch_type: MiniBatchType,
    pub input: Matrix,
    pub target: Option<Matrix>,
}

/// Батч строк одинаковой глубины последовательности.
#[derive(Debug, Clone)]
pub struct MiniBatch {
    rows: Vec<usize>,
    steps: Vec<MiniBatchStep>,
    sequential: bool,
}

impl MiniBatch {
    /// Создает пустой батч для заданных индексов строк.
    pub fn new(rows: Vec<usize>, sequential: bool) -> Self {
        Self {
            rows,
            steps: Vec::new(),
            sequential,
        }
    }

    /// Добавляет очередной временной шаг.
    pub fn add(&mut self, batch_type: MiniBatchType, input: Matrix, target: Option<Matrix>) {
        self.steps.push(MiniBatchStep {
            batch_type,
            input,
            target,
        });
    }

    /// Индексы исходных строк, из которых собран батч.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Количество строк в батче.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Глубина последовательности (количество шагов).
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// Собран ли батч из последовательных данных.
    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    /// Упорядоченные временные шаги.
    pub fn steps(&self) -> &[MiniBatchStep] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_ordering() {
        let mut batch = MiniBatch::new(vec![0, 1], true);
        batch.add(MiniBatchType::SequenceStart, Matrix::zeros(2, 3), None);
        batch.add(MiniBatchType::Standard, Matrix::zeros(2, 3), None);
        batch.add(MiniBatchType::SequenceEnd, Matrix::zeros(2, 3), None);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.depth(), 3);
        assert_eq!(batch.steps()[0].batch_type, MiniBatchType::SequenceStart);
        assert_eq!(batch.steps()[2].batch_type, MiniBatchType::SequenceEnd);
    }
}
