//! Ядра функций активации и их производных.
//!
//! Все ядра — чистые функции без разделяемого состояния. Производная
//! всегда вычисляется в точке пре-активации (по сохраненному входу),
//! а не по выходу — это исключает дрейф от повторного вычисления.
//!
//! Сигмоида и экспонента ограничены конечным диапазоном, чтобы
//! переполнение не давало NaN/Inf в градиентах.

use super::Matrix;
use serde::{Deserialize, Serialize};

const TOO_SMALL: f32 = -1.0e8;
const TOO_BIG: f32 = 1.0e8;

/// Ограничивает значение конечным диапазоном.
fn constrain(val: f32) -> f32 {
    if val.is_nan() {
        0.0
    } else if val < TOO_SMALL {
        TOO_SMALL
    } else if val > TOO_BIG {
        TOO_BIG
    } else {
        val
    }
}

/// Экспонента с защитой от переполнения.
fn bounded_exp(val: f32) -> f32 {
    constrain(val.exp())
}

pub fn sigmoid(val: f32) -> f32 {
    constrain(1.0 / (1.0 + bounded_exp(-val)))
}

pub fn sigmoid_derivative(val: f32) -> f32 {
    let score = sigmoid(val);
    constrain(score * (1.0 - score))
}

pub fn tanh(val: f32) -> f32 {
    val.tanh()
}

pub fn tanh_derivative(val: f32) -> f32 {
    1.0 - val.tanh().powi(2)
}

pub fn relu(val: f32) -> f32 {
    if val <= 0.0 {
        0.0
    } else {
        constrain(val)
    }
}

pub fn relu_derivative(val: f32) -> f32 {
    if val <= 0.0 {
        0.0
    } else {
        1.0
    }
}

pub fn leaky_relu(val: f32) -> f32 {
    if val <= 0.0 {
        0.01 * val
    } else {
        constrain(val)
    }
}

pub fn leaky_relu_derivative(val: f32) -> f32 {
    if val <= 0.0 {
        0.01
    } else {
        1.0
    }
}

/// Вид функции активации узла графа.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    Identity,
    Relu,
    LeakyRelu,
    Sigmoid,
    Tanh,
}

impl ActivationKind {
    /// Применяет ядро к каждому элементу матрицы.
    pub fn apply(&self, input: &Matrix) -> Matrix {
        match self {
            ActivationKind::Identity => input.clone(),
            ActivationKind::Relu => input.map(relu),
            ActivationKind::LeakyRelu => input.map(leaky_relu),
            ActivationKind::Sigmoid => input.map(sigmoid),
            ActivationKind::Tanh => input.map(tanh),
        }
    }

    /// Производная ядра в точке пре-активации.
    pub fn derivative(&self, input: &Matrix) -> Matrix {
        match self {
            ActivationKind::Identity => input.map(|_| 1.0),
            ActivationKind::Relu => input.map(relu_derivative),
            ActivationKind::LeakyRelu => input.map(leaky_relu_derivative),
            ActivationKind::Sigmoid => input.map(sigmoid_derivative),
            ActivationKind::Tanh => input.map(tanh_derivative),
        }
    }
}
