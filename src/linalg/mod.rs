//! Модуль, определяющий матричную границу движка: `Matrix` и `Vector`.
//!
//! Движок исполнения графа не владеет арифметикой как подсистемой — ему
//! нужен лишь узкий контракт: поэлементные операции, матричные произведения
//! (включая варианты с транспонированием), построчные/постолбцовые
//! агрегации, ядра активаций с производными и бинарная сериализация.
//!
//! Разделяемое владение реализовано через атомарный счетчик ссылок:
//! `clone()` — это retain, `drop` — это release. Хранилище освобождается
//! детерминированно, когда счетчик достигает нуля. Текущее значение
//! счетчика доступно через [`Matrix::ref_count`] — движок использует его
//! в инвариантных проверках таблицы памяти.

pub mod activation;
pub mod serialize;

pub use activation::ActivationKind;

use ndarray::{Array1, Array2, Axis};
use std::sync::Arc;
use thiserror::Error;

/// Ошибки матричного слоя.
#[derive(Error, Debug)]
pub enum LinalgError {
    #[error("Несовместимые формы: {0}")]
    ShapeMismatch(String),
    #[error("Ошибка ввода/вывода: {0}")]
    Io(#[from] std::io::Error),
}

pub type LinalgResult<T> = Result<T, LinalgError>;

/// Матрица с разделяемым владением (строки — образцы батча).
///
/// Дескриптор дешев в копировании: `clone()` увеличивает счетчик ссылок,
/// не трогая данные. Все операции возвращают новые матрицы; движок никогда
/// не мутирует буфер, которым не владеет монопольно.
#[derive(Debug, Clone)]
pub struct Matrix {
    data: Arc<Array2<f32>>,
}

impl Matrix {
    /// Оборачивает готовый массив в разделяемый дескриптор.
    pub fn new(data: Array2<f32>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// Нулевая матрица заданной формы.
    pub fn zeros(rows: usize, columns: usize) -> Self {
        Self::new(Array2::zeros((rows, columns)))
    }

    /// Собирает матрицу из списка строк одинаковой длины.
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        let row_count = rows.len();
        let column_count = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Array2::zeros((row_count, column_count));
        for (i, row) in rows.iter().enumerate() {
            debug_assert_eq!(row.len(), column_count);
            for (j, &v) in row.iter().enumerate() {
                data[[i, j]] = v;
            }
        }
        Self::new(data)
    }

    /// Количество строк.
    pub fn row_count(&self) -> usize {
        self.data.nrows()
    }

    /// Количество столбцов.
    pub fn column_count(&self) -> usize {
        self.data.ncols()
    }

    /// Доступ к данным (read-only).
    pub fn as_array(&self) -> &Array2<f32> {
        &self.data
    }

    /// Текущее значение счетчика ссылок на буфер.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Строка как вектор значений.
    pub fn row(&self, index: usize) -> Vec<f32> {
        self.data.row(index).to_vec()
    }

    // --- Поэлементные операции ---

    pub fn add(&self, other: &Matrix) -> Matrix {
        debug_assert_eq!(self.data.dim(), other.data.dim());
        Matrix::new(&*self.data + &*other.data)
    }

    pub fn subtract(&self, other: &Matrix) -> Matrix {
        debug_assert_eq!(self.data.dim(), other.data.dim());
        Matrix::new(&*self.data - &*other.data)
    }

    pub fn pointwise_multiply(&self, other: &Matrix) -> Matrix {
        debug_assert_eq!(self.data.dim(), other.data.dim());
        Matrix::new(&*self.data * &*other.data)
    }

    pub fn pointwise_divide(&self, other: &Matrix) -> Matrix {
        debug_assert_eq!(self.data.dim(), other.data.dim());
        Matrix::new(&*self.data / &*other.data)
    }

    /// Применяет функцию к каждому элементу.
    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Matrix {
        Matrix::new(self.data.mapv(|v| f(v)))
    }

    /// Умножение каждого элемента на скаляр.
    pub fn scale(&self, scalar: f32) -> Matrix {
        Matrix::new(self.data.mapv(|v| v * scalar))
    }

    // --- Матричные произведения ---

    /// Матричное произведение `self · other`.
    pub fn multiply(&self, other: &Matrix) -> Matrix {
        Matrix::new(self.data.dot(&*other.data))
    }

    /// `self · otherᵀ` — без материализации транспонированной копии.
    pub fn transpose_and_multiply(&self, other: &Matrix) -> Matrix {
        Matrix::new(self.data.dot(&other.data.t()))
    }

    /// `selfᵀ · other`.
    pub fn transpose_this_and_multiply(&self, other: &Matrix) -> Matrix {
        Matrix::new(self.data.t().dot(&*other.data))
    }

    /// Транспонированная копия.
    pub fn transpose(&self) -> Matrix {
        Matrix::new(self.data.t().to_owned())
    }

    // --- Агрегации ---

    /// Суммы по строкам, умноженные на коэффициент.
    pub fn row_sums(&self, coefficient: f32) -> Vector {
        Vector::new(self.data.sum_axis(Axis(1)) * coefficient)
    }

    /// Суммы по столбцам, умноженные на коэффициент.
    pub fn column_sums(&self, coefficient: f32) -> Vector {
        Vector::new(self.data.sum_axis(Axis(0)) * coefficient)
    }

    /// L2-норма каждой строки.
    pub fn row_l2_norm(&self) -> Vector {
        let norms = self
            .data
            .axis_iter(Axis(0))
            .map(|row| row.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect::<Vec<_>>();
        Vector::new(Array1::from(norms))
    }

    /// L2-норма каждого столбца.
    pub fn column_l2_norm(&self) -> Vector {
        let norms = self
            .data
            .axis_iter(Axis(1))
            .map(|col| col.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect::<Vec<_>>();
        Vector::new(Array1::from(norms))
    }

    /// Прибавляет вектор к каждой строке (broadcast по столбцам).
    pub fn add_to_each_row(&self, vector: &Vector) -> Matrix {
        debug_assert_eq!(self.column_count(), vector.len());
        Matrix::new(&*self.data + &vector.data.view().insert_axis(Axis(0)))
    }
}

impl PartialEq for Matrix {
    fn eq(&self, other: &Self) -> bool {
        *self.data == *other.data
    }
}

/// Вектор с разделяемым владением.
#[derive(Debug, Clone)]
pub struct Vector {
    data: Arc<Array1<f32>>,
}

impl Vector {
    pub fn new(data: Array1<f32>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub fn zeros(len: usize) -> Self {
        Self::new(Array1::zeros(len))
    }

    pub fn from_vec(data: Vec<f32>) -> Self {
        Self::new(Array1::from(data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_array(&self) -> &Array1<f32> {
        &self.data
    }

    pub fn add(&self, other: &Vector) -> Vector {
        debug_assert_eq!(self.len(), other.len());
        Vector::new(&*self.data + &*other.data)
    }

    pub fn subtract(&self, other: &Vector) -> Vector {
        debug_assert_eq!(self.len(), other.len());
        Vector::new(&*self.data - &*other.data)
    }

    pub fn scale(&self, scalar: f32) -> Vector {
        Vector::new(self.data.mapv(|v| v * scalar))
    }

    /// L2-норма вектора.
    pub fn l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl PartialEq for Vector {
    fn eq(&self, other: &Self) -> bool {
        *self.data == *other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_clone_is_retain() {
        let m = Matrix::new(array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(m.ref_count(), 1);
        let m2 = m.clone();
        assert_eq!(m.ref_count(), 2);
        drop(m2);
        assert_eq!(m.ref_count(), 1);
    }

    #[test]
    fn test_matmul_and_transposed_products() {
        let a = Matrix::new(array![[1.0, 2.0], [3.0, 4.0]]);
        let b = Matrix::new(array![[5.0, 6.0], [7.0, 8.0]]);

        let ab = a.multiply(&b);
        assert_eq!(ab.as_array(), &array![[19.0, 22.0], [43.0, 50.0]]);

        // a · bᵀ должно совпадать с явным транспонированием
        let abt = a.transpose_and_multiply(&b);
        assert_eq!(abt.as_array(), a.multiply(&b.transpose()).as_array());

        let atb = a.transpose_this_and_multiply(&b);
        assert_eq!(atb.as_array(), a.transpose().multiply(&b).as_array());
    }

    #[test]
    fn test_row_and_column_sums() {
        let m = Matrix::new(array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(m.row_sums(1.0).as_array(), &array![3.0, 7.0]);
        assert_eq!(m.column_sums(0.5).as_array(), &array![2.0, 3.0]);
    }

    #[test]
    fn test_add_to_each_row() {
        let m = Matrix::new(array![[1.0, 2.0], [3.0, 4.0]]);
        let v = Vector::from_vec(vec![10.0, 20.0]);
        let out = m.add_to_each_row(&v);
        assert_eq!(out.as_array(), &array![[11.0, 22.0], [13.0, 24.0]]);
    }

    #[test]
    fn test_l2_norms() {
        let m = Matrix::new(array![[3.0, 4.0], [0.0, 5.0]]);
        assert_eq!(m.row_l2_norm().as_array(), &array![5.0, 5.0]);
        let col = m.column_l2_norm();
        assert!((col.as_array()[0] - 3.0).abs() < 1e-6);
    }
}
