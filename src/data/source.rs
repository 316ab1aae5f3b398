//! Источники данных: преобразование строк датасета в мини-батчи.
//!
//! Последовательные строки группируются в «корзины» по глубине
//! (количеству временных шагов), чтобы каждый батч содержал только
//! последовательности одинаковой длины.

use super::minibatch::{MiniBatch, MiniBatchType};
use crate::linalg::Matrix;
use std::collections::BTreeMap;
use thiserror::Error;

/// Ошибки уровня источников данных.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Строки батча имеют разную глубину: ожидалась {expected}, найдена {actual}")]
    MismatchedDepth { expected: usize, actual: usize },
    #[error("Индекс строки {0} вне диапазона (всего строк: {1})")]
    RowOutOfRange(usize, usize),
    #[error("Батч не может быть пустым")]
    EmptyBatch,
    #[error("Операция не поддерживается: {0}")]
    Unsupported(String),
}

pub type DataResult<T> = Result<T, DataError>;

/// Адаптер датасета для движка исполнения графа.
///
/// Контракт: `get_buckets` разбивает все индексы строк на корзины
/// одинаковой глубины (каждая строка ровно в одной корзине);
/// `get` строит мини-батч из подмножества строк одной корзины.
pub trait DataSource: Send + Sync {
    /// Последовательные ли данные (больше одного шага на строку).
    fn is_sequential(&self) -> bool;

    /// Размерность входного вектора признаков.
    fn input_size(&self) -> usize;

    /// Размерность выхода, если источник несет целевые значения.
    fn output_size(&self) -> Option<usize>;

    /// Количество строк в датасете.
    fn row_count(&self) -> usize;

    /// Строит мини-батч из заданных строк.
    fn get(&self, rows: &[usize]) -> DataResult<MiniBatch>;

    /// Разбивает индексы строк на корзины одинаковой глубины.
    fn get_buckets(&self) -> Vec<Vec<usize>>;

    /// Пересоздает источник над другим набором данных.
    fn clone_with(&self, _data: Vec<Matrix>) -> DataResult<Box<dyn DataSource>> {
        Err(DataError::Unsupported(
            "клонирование с другим набором данных".to_string(),
        ))
    }
}

/// Источник последовательных данных: каждая строка — матрица
/// `глубина × входная размерность` (одна строка матрицы на шаг).
pub struct SequentialDataSource {
    data: Vec<Matrix>,
    targets: Option<Vec<Matrix>>,
    row_depth: Vec<usize>,
    input_size: usize,
    output_size: Option<usize>,
}

impl SequentialDataSource {
    /// Создает источник без целевых значений.
    pub fn new(data: Vec<Matrix>) -> Self {
        let row_depth: Vec<usize> = data.iter().map(|m| m.row_count()).collect();
        let input_size = data.first().map(|m| m.column_count()).unwrap_or(0);
        Self {
            data,
            targets: None,
            row_depth,
            input_size,
            output_size: None,
        }
    }

    /// Создает источник с целевой последовательностью на каждую строку.
    /// Глубина целей должна совпадать с глубиной входов построчно.
    pub fn with_targets(data: Vec<Matrix>, targets: Vec<Matrix>) -> DataResult<Self> {
        if data.len() != targets.len() {
            return Err(DataError::MismatchedDepth {
                expected: data.len(),
                actual: targets.len(),
            });
        }
        for (input, target) in data.iter().zip(targets.iter()) {
            if input.row_count() != target.row_count() {
                return Err(DataError::MismatchedDepth {
                    expected: input.row_count(),
                    actual: target.row_count(),
                });
            }
        }
        let output_size = targets.first().map(|m| m.column_count());
        let mut source = Self::new(data);
        source.targets = Some(targets);
        source.output_size = output_size;
        Ok(source)
    }

    /// Глубина последовательности для строки.
    pub fn sequence_depth(&self, row: usize) -> Option<usize> {
        self.row_depth.get(row).copied()
    }

    /// Собирает матрицу шага `step` из `step`-х срезов выбранных строк.
    fn step_matrix(source: &[Matrix], rows: &[usize], step: usize) -> Matrix {
        let slices: Vec<Vec<f32>> = rows.iter().map(|&r| source[r].row(step)).collect();
        Matrix::from_rows(&slices)
    }
}

impl DataSource for SequentialDataSource {
    fn is_sequential(&self) -> bool {
        true
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> Option<usize> {
        self.output_size
    }

    fn row_count(&self) -> usize {
        self.data.len()
    }

    fn get(&self, rows: &[usize]) -> DataResult<MiniBatch> {
        if rows.is_empty() {
            return Err(DataError::EmptyBatch);
        }
        for &r in rows {
            if r >= self.data.len() {
                return Err(DataError::RowOutOfRange(r, self.data.len()));
            }
        }

        // Предусловие: все строки батча одной глубины.
        let depth = self.row_depth[rows[0]];
        for &r in rows {
            if self.row_depth[r] != depth {
                return Err(DataError::MismatchedDepth {
                    expected: depth,
                    actual: self.row_depth[r],
                });
            }
        }

        let mut batch = MiniBatch::new(rows.to_vec(), true);
        for step in 0..depth {
            let input = Self::step_matrix(&self.data, rows, step);
            let target = self
                .targets
                .as_ref()
                .map(|t| Self::step_matrix(t, rows, step));
            // Начало проверяется раньше конца: для глубины 1 шаг
            // помечается как SequenceStart.
            let batch_type = if step == 0 {
                MiniBatchType::SequenceStart
            } else if step == depth - 1 {
                MiniBatchType::SequenceEnd
            } else {
                MiniBatchType::Standard
            };
            batch.add(batch_type, input, target);
        }
        Ok(batch)
    }

    fn get_buckets(&self) -> Vec<Vec<usize>> {
        let mut buckets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (row, &depth) in self.row_depth.iter().enumerate() {
            buckets.entry(depth).or_default().push(row);
        }
        buckets.into_values().collect()
    }
}

/// Источник не-последовательных данных: таблица признаков и целей,
/// одна строка — один образец, один временной шаг на батч.
pub struct VectorDataSource {
    features: Matrix,
    targets: Matrix,
}

impl VectorDataSource {
    pub fn new(features: Matrix, targets: Matrix) -> DataResult<Self> {
        if features.row_count() != targets.row_count() {
            return Err(DataError::MismatchedDepth {
                expected: features.row_count(),
                actual: targets.row_count(),
            });
        }
        Ok(Self { features, targets })
    }

    fn select_rows(matrix: &Matrix, rows: &[usize]) -> Matrix {
        let slices: Vec<Vec<f32>> = rows.iter().map(|&r| matrix.row(r)).collect();
        Matrix::from_rows(&slices)
    }
}

impl DataSource for VectorDataSource {
    fn is_sequential(&self) -> bool {
        false
    }

    fn input_size(&self) -> usize {
        self.features.column_count()
    }

    fn output_size(&self) -> Option<usize> {
        Some(self.targets.column_count())
    }

    fn row_count(&self) -> usize {
        self.features.row_count()
    }

    fn get(&self, rows: &[usize]) -> DataResult<MiniBatch> {
        if rows.is_empty() {
            return Err(DataError::EmptyBatch);
        }
        for &r in rows {
            if r >= self.row_count() {
                return Err(DataError::RowOutOfRange(r, self.row_count()));
            }
        }
        let mut batch = MiniBatch::new(rows.to_vec(), false);
        batch.add(
            MiniBatchType::Standard,
            Self::select_rows(&self.features, rows),
            Some(Self::select_rows(&self.targets, rows)),
        );
        Ok(batch)
    }

    fn get_buckets(&self) -> Vec<Vec<usize>> {
        vec![(0..self.row_count()).collect()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sequence(depth: usize, value: f32) -> Matrix {
        Matrix::new(ndarray::Array2::from_elem((depth, 2), value))
    }

    #[test]
    fn test_buckets_partition_rows_by_depth() {
        let source = SequentialDataSource::new(vec![
            sequence(2, 0.0),
            sequence(3, 1.0),
            sequence(2, 2.0),
            sequence(1, 3.0),
            sequence(3, 4.0),
        ]);

        let buckets = source.get_buckets();
        let mut all: Vec<usize> = buckets.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);

        // внутри корзины глубина однородна
        for bucket in &buckets {
            let depth = source.sequence_depth(bucket[0]).unwrap();
            for &row in bucket {
                assert_eq!(source.sequence_depth(row), Some(depth));
            }
        }
    }

    #[test]
    fn test_minibatch_tagging() {
        let source = SequentialDataSource::new(vec![sequence(3, 1.0), sequence(3, 2.0)]);
        let batch = source.get(&[0, 1]).unwrap();

        assert_eq!(batch.depth(), 3);
        assert_eq!(batch.steps()[0].batch_type, MiniBatchType::SequenceStart);
        assert_eq!(batch.steps()[1].batch_type, MiniBatchType::Standard);
        assert_eq!(batch.steps()[2].batch_type, MiniBatchType::SequenceEnd);
    }

    #[test]
    fn test_depth_one_is_sequence_start() {
        let source = SequentialDataSource::new(vec![sequence(1, 1.0)]);
        let batch = source.get(&[0]).unwrap();
        assert_eq!(batch.depth(), 1);
        assert_eq!(batch.steps()[0].batch_type, MiniBatchType::SequenceStart);
    }

    #[test]
    fn test_mismatched_depth_rejected() {
        let source = SequentialDataSource::new(vec![sequence(2, 1.0), sequence(3, 2.0)]);
        let err = source.get(&[0, 1]).unwrap_err();
        assert!(matches!(err, DataError::MismatchedDepth { .. }));
    }

    #[test]
    fn test_timestep_major_transposition() {
        // две последовательности глубины 2, признаки различимы по строкам
        let a = Matrix::new(array![[1.0, 1.0], [2.0, 2.0]]);
        let b = Matrix::new(array![[3.0, 3.0], [4.0, 4.0]]);
        let source = SequentialDataSource::new(vec![a, b]);
        let batch = source.get(&[0, 1]).unwrap();

        // шаг 0: первые срезы обеих последовательностей
        assert_eq!(batch.steps()[0].input.as_array(), &array![[1.0, 1.0], [3.0, 3.0]]);
        // шаг 1: вторые срезы
        assert_eq!(batch.steps()[1].input.as_array(), &array![[2.0, 2.0], [4.0, 4.0]]);
    }

    #[test]
    fn test_clone_with_unsupported() {
        let source = SequentialDataSource::new(vec![sequence(1, 0.0)]);
        assert!(matches!(
            source.clone_with(vec![]),
            Err(DataError::Unsupported(_))
        ));
    }

    #[test]
    fn test_vector_source_single_step() {
        let features = Matrix::new(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let targets = Matrix::new(array![[1.0], [0.0], [1.0]]);
        let source = VectorDataSource::new(features, targets).unwrap();

        assert!(!source.is_sequential());
        assert_eq!(source.get_buckets(), vec![vec![0, 1, 2]]);

        let batch = source.get(&[0, 2]).unwrap();
        assert_eq!(batch.depth(), 1);
        assert_eq!(batch.steps()[0].input.as_array(), &array![[1.0, 2.0], [5.0, 6.0]]);
        assert_eq!(
            batch.steps()[0].target.as_ref().unwrap().as_array(),
            &array![[1.0], [1.0]]
        );
    }
}
