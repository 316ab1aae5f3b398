//! Бинарная сериализация матриц.
//!
//! Формат: `u32 rows, u32 columns`, затем элементы построчно
//! (row-major) как little-endian `f32`. Стабильность формата между
//! версиями не гарантируется.

use super::{LinalgResult, Matrix};
use ndarray::Array2;
use std::io::{Read, Write};

/// Записывает матрицу в поток.
pub fn write_matrix<W: Write>(writer: &mut W, matrix: &Matrix) -> LinalgResult<()> {
    writer.write_all(&(matrix.row_count() as u32).to_le_bytes())?;
    writer.write_all(&(matrix.column_count() as u32).to_le_bytes())?;
    for &val in matrix.as_array().iter() {
        writer.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

/// Читает матрицу из потока.
pub fn read_matrix<R: Read>(reader: &mut R) -> LinalgResult<Matrix> {
    let mut dims = [0u8; 4];
    reader.read_exact(&mut dims)?;
    let rows = u32::from_le_bytes(dims) as usize;
    reader.read_exact(&mut dims)?;
    let columns = u32::from_le_bytes(dims) as usize;

    let mut values = Vec::with_capacity(rows * columns);
    let mut buf = [0u8; 4];
    for _ in 0..rows * columns {
        reader.read_exact(&mut buf)?;
        values.push(f32::from_le_bytes(buf));
    }

    let data = Array2::from_shape_vec((rows, columns), values)
        .expect("размер буфера совпадает с заявленной формой");
    Ok(Matrix::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_matrix_round_trip() {
        let m = Matrix::new(array![[1.5, -2.0, 0.0], [3.25, 4.0, -0.5]]);
        let mut buf = Vec::new();
        write_matrix(&mut buf, &m).unwrap();
        // 8 байт заголовка + 6 значений по 4 байта
        assert_eq!(buf.len(), 8 + 6 * 4);

        let restored = read_matrix(&mut buf.as_slice()).unwrap();
        assert_eq!(restored, m);
    }

    #[test]
    fn test_empty_matrix() {
        let m = Matrix::zeros(0, 0);
        let mut buf = Vec::new();
        write_matrix(&mut buf, &m).unwrap();
        let restored = read_matrix(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.row_count(), 0);
        assert_eq!(restored.column_count(), 0);
    }
}
