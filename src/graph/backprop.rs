//! Замыкания обратного распространения.
//!
//! Каждое замыкание владеет захваченными на прямом проходе матрицами и
//! потребляется ровно один раз: `backward` забирает `self` по значению.
//! Если запуск отброшен без обратного прохода, захваченные матрицы
//! отпускаются при уничтожении замыкания — оба пути освобождают их
//! ровно один раз.
//!
//! Соглашение о сигнале ошибки: `target − output`; обновления весов
//! прибавляют градиент, масштабированный на скорость обучения батча.

use super::learning::LearningContext;
use super::node::{DenseParams, RecurrentParams};
use super::{ExecutionContext, GraphData, GraphError, GraphResult};
use crate::linalg::{ActivationKind, Matrix};
use std::sync::{Arc, Mutex};

pub enum Backpropagation {
    /// Захваченные пре-активации каждой разложенной матрицы входа.
    Activation {
        kind: ActivationKind,
        inputs: Vec<Matrix>,
    },
    /// Захваченный вход полносвязного слоя.
    Dense {
        params: Arc<Mutex<DenseParams>>,
        input: Matrix,
    },
    /// Захваченные вход и предыдущее состояние рекуррентного слоя;
    /// пре-активация читается из кэша преобразований запуска.
    Recurrent {
        activation: ActivationKind,
        params: Arc<Mutex<RecurrentParams>>,
        input: Matrix,
        previous: Matrix,
        transform_id: u64,
        sequence_start: bool,
    },
}

impl Backpropagation {
    /// Вычисляет градиент по входу из сигнала ошибки на выходе.
    ///
    /// Обновления обучаемых параметров не применяются на месте — они
    /// регистрируются в контексте обучения и ждут `apply_updates`.
    pub fn backward(
        self,
        error: &GraphData,
        execution: &ExecutionContext,
        learning: &mut LearningContext,
    ) -> GraphResult<GraphData> {
        match self {
            Backpropagation::Activation { kind, inputs } => {
                let error_slices = error.decompose();
                if error_slices.len() != inputs.len() {
                    return Err(GraphError::Precondition(format!(
                        "сигнал ошибки разложен на {} матриц, ожидалось {}",
                        error_slices.len(),
                        inputs.len()
                    )));
                }
                let gradients = inputs
                    .iter()
                    .zip(error_slices.iter())
                    .map(|(input, slice)| kind.derivative(input).pointwise_multiply(slice))
                    .collect();
                Ok(GraphData::compose(gradients))
            }

            Backpropagation::Dense { params, input } => {
                let error_matrix = error.matrix();
                let input_gradient = {
                    let p = params.lock().map_err(|_| {
                        GraphError::Precondition("параметры слоя отравлены".to_string())
                    })?;
                    error_matrix.transpose_and_multiply(&p.weight)
                };

                let weight_gradient = input.transpose_this_and_multiply(error_matrix);
                let bias_gradient = error_matrix.column_sums(1.0);
                let rate = learning.batch_learning_rate();
                let params_for_update = Arc::clone(&params);
                learning.store(
                    error.clone(),
                    Box::new(move |_| {
                        if let Ok(mut p) = params_for_update.lock() {
                            p.weight = p.weight.add(&weight_gradient.scale(rate));
                            p.bias = p.bias.add(&bias_gradient.scale(rate));
                        }
                    }),
                );

                Ok(GraphData::Single(input_gradient))
            }

            Backpropagation::Recurrent {
                activation,
                params,
                input,
                previous,
                transform_id,
                sequence_start,
            } => {
                let pre_activation =
                    execution.get_input_transform(transform_id).ok_or_else(|| {
                        GraphError::Precondition(format!(
                            "пре-активация {} отсутствует в кэше преобразований",
                            transform_id
                        ))
                    })?;

                let delta = activation
                    .derivative(&pre_activation)
                    .pointwise_multiply(error.matrix());

                let (input_gradient, state_gradient) = {
                    let p = params.lock().map_err(|_| {
                        GraphError::Precondition("параметры слоя отравлены".to_string())
                    })?;
                    (
                        delta.transpose_and_multiply(&p.input_weight),
                        delta.transpose_and_multiply(&p.hidden_weight),
                    )
                };

                let input_weight_gradient = input.transpose_this_and_multiply(&delta);
                let hidden_weight_gradient = previous.transpose_this_and_multiply(&delta);
                let bias_gradient = delta.column_sums(1.0);
                // градиент начального состояния накапливается только на
                // первом шаге последовательности
                let initial_state_gradient = if sequence_start {
                    Some(state_gradient.column_sums(1.0))
                } else {
                    None
                };

                let rate = learning.batch_learning_rate();
                let params_for_update = Arc::clone(&params);
                learning.store(
                    error.clone(),
                    Box::new(move |_| {
                        if let Ok(mut p) = params_for_update.lock() {
                            p.input_weight = p.input_weight.add(&input_weight_gradient.scale(rate));
                            p.hidden_weight =
                                p.hidden_weight.add(&hidden_weight_gradient.scale(rate));
                            p.bias = p.bias.add(&bias_gradient.scale(rate));
                            if let Some(initial) = &initial_state_gradient {
                                p.initial_state = p.initial_state.add(&initial.scale(rate));
                            }
                        }
                    }),
                );

                Ok(GraphData::Single(input_gradient))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::learning::LearningConfig;
    use ndarray::array;

    fn learning() -> LearningContext {
        LearningContext::new(LearningConfig::new(0.1, 1))
    }

    #[test]
    fn test_relu_backward_masks_negative_inputs() {
        let execution = ExecutionContext::new();
        let mut ctx = learning();

        let backprop = Backpropagation::Activation {
            kind: ActivationKind::Relu,
            inputs: vec![Matrix::new(array![[-1.0, 2.0, 0.0]])],
        };
        let error = GraphData::Single(Matrix::new(array![[5.0, 5.0, 5.0]]));
        let grad = backprop.backward(&error, &execution, &mut ctx).unwrap();

        // производная в точке пре-активации: 0 для x <= 0, 1 иначе
        assert_eq!(grad.matrix().as_array(), &array![[0.0, 5.0, 0.0]]);
    }

    #[test]
    fn test_dense_backward_gradients() {
        let execution = ExecutionContext::new();
        let mut ctx = learning();

        let params = Arc::new(Mutex::new(DenseParams {
            weight: Matrix::new(array![[1.0, 0.0], [0.0, 1.0]]),
            bias: crate::linalg::Vector::zeros(2),
        }));
        let input = Matrix::new(array![[1.0, 2.0]]);
        let backprop = Backpropagation::Dense {
            params: Arc::clone(&params),
            input,
        };

        let error = GraphData::Single(Matrix::new(array![[0.5, -0.5]]));
        let grad = backprop.backward(&error, &execution, &mut ctx).unwrap();

        // входной градиент: e · Wᵀ, для единичной матрицы — сам сигнал
        assert_eq!(grad.matrix().as_array(), &array![[0.5, -0.5]]);

        // обновление отложено: веса еще не изменились
        assert_eq!(
            params.lock().unwrap().weight.as_array(),
            &array![[1.0, 0.0], [0.0, 1.0]]
        );

        ctx.apply_updates();
        // W += lr · xᵀe, lr = 0.1: ΔW = 0.1 · [[0.5, -0.5], [1.0, -1.0]]
        let updated = params.lock().unwrap();
        assert!((updated.weight.as_array()[[0, 0]] - 1.05).abs() < 1e-6);
        assert!((updated.weight.as_array()[[1, 1]] - 0.9).abs() < 1e-6);
        assert!((updated.bias.as_array()[0] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_recurrent_backward_requires_cached_transform() {
        let execution = ExecutionContext::new();
        let mut ctx = learning();

        let params = Arc::new(Mutex::new(RecurrentParams {
            input_weight: Matrix::new(array![[1.0]]),
            hidden_weight: Matrix::new(array![[1.0]]),
            bias: crate::linalg::Vector::zeros(1),
            initial_state: crate::linalg::Vector::zeros(1),
        }));
        let backprop = Backpropagation::Recurrent {
            activation: ActivationKind::Identity,
            params,
            input: Matrix::new(array![[1.0]]),
            previous: Matrix::new(array![[0.0]]),
            transform_id: 42,
            sequence_start: true,
        };

        let error = GraphData::Single(Matrix::new(array![[1.0]]));
        let result = backprop.backward(&error, &execution, &mut ctx);
        assert!(matches!(result, Err(GraphError::Precondition(_))));
    }
}
