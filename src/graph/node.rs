//! Полиморфные узлы графа вычислений.
//!
//! Узел — закрытое перечисление операций с единственной функцией
//! диспетчеризации прямого прохода. Каждый прямой проход возвращает
//! выходные данные и, если узел участвует в обратном проходе,
//! замыкание обратного распространения, захватившее ровно то
//! состояние, которое нужно для вычисления градиента по входу.

use super::backprop::Backpropagation;
use super::context::Context;
use super::{GraphError, GraphResult};
use crate::data::MiniBatchType;
use crate::linalg::{ActivationKind, Matrix, Vector};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::sync::{Arc, Mutex};

/// Обучаемые параметры полносвязного слоя.
#[derive(Debug)]
pub struct DenseParams {
    pub weight: Matrix,
    pub bias: Vector,
}

/// Обучаемые параметры простого рекуррентного слоя.
#[derive(Debug)]
pub struct RecurrentParams {
    pub input_weight: Matrix,
    pub hidden_weight: Matrix,
    pub bias: Vector,
    /// Обучаемое начальное скрытое состояние (одна строка).
    pub initial_state: Vector,
}

/// Операция, выполняемая узлом.
#[derive(Clone)]
pub enum NodeOp {
    /// Входной узел: пропускает данные без изменений.
    FlowThrough,
    /// Поэлементная функция активации.
    Activation(ActivationKind),
    /// Полносвязный слой `y = xW + b`.
    Dense(Arc<Mutex<DenseParams>>),
    /// Рекуррентный слой: скрытое состояние живет в таблице памяти
    /// контекста выполнения под слотом узла.
    Recurrent {
        activation: ActivationKind,
        params: Arc<Mutex<RecurrentParams>>,
    },
}

/// Узел графа: операция плюс необязательное имя для адресации.
#[derive(Clone)]
pub struct Node {
    pub id: super::NodeId,
    pub name: Option<String>,
    pub op: NodeOp,
}

fn xavier_uniform(rows: usize, columns: usize) -> Matrix {
    let limit = (6.0 / (rows + columns) as f32).sqrt();
    Matrix::new(Array2::random((rows, columns), Uniform::new(-limit, limit)))
}

impl NodeOp {
    /// Полносвязный слой со случайной инициализацией весов.
    pub fn dense(input_size: usize, output_size: usize) -> NodeOp {
        NodeOp::Dense(Arc::new(Mutex::new(DenseParams {
            weight: xavier_uniform(input_size, output_size),
            bias: Vector::zeros(output_size),
        })))
    }

    /// Рекуррентный слой со случайной инициализацией весов.
    pub fn recurrent(input_size: usize, hidden_size: usize, activation: ActivationKind) -> NodeOp {
        NodeOp::Recurrent {
            activation,
            params: Arc::new(Mutex::new(RecurrentParams {
                input_weight: xavier_uniform(input_size, hidden_size),
                hidden_weight: xavier_uniform(hidden_size, hidden_size),
                bias: Vector::zeros(hidden_size),
                initial_state: Vector::zeros(hidden_size),
            })),
        }
    }
}

impl Node {
    /// Слот таблицы памяти, закрепленный за узлом.
    pub fn memory_key(&self) -> String {
        format!("node-{}", self.id)
    }

    /// Прямой проход: потребляет контекст активации, возвращает выход и
    /// замыкание обратного распространения (если узел не терминален на
    /// обратном пути).
    pub fn forward(
        &self,
        ctx: &Context,
    ) -> GraphResult<(super::GraphData, Option<Backpropagation>)> {
        match &self.op {
            NodeOp::FlowThrough => Ok((ctx.data().clone(), None)),

            NodeOp::Activation(kind) => {
                let inputs = ctx.data().decompose();
                let outputs = inputs.iter().map(|m| kind.apply(m)).collect();
                let output = super::GraphData::compose(outputs);
                // захватываем пре-активации: производная считается по ним
                let backprop = Backpropagation::Activation {
                    kind: *kind,
                    inputs,
                };
                Ok((output, Some(backprop)))
            }

            NodeOp::Dense(params) => {
                let input = ctx.data().matrix().clone();
                let output = {
                    let p = params.lock().map_err(|_| {
                        GraphError::Precondition("параметры слоя отравлены".to_string())
                    })?;
                    input.multiply(&p.weight).add_to_each_row(&p.bias)
                };
                let backprop = Backpropagation::Dense {
                    params: Arc::clone(params),
                    input,
                };
                Ok((super::GraphData::Single(output), Some(backprop)))
            }

            NodeOp::Recurrent { activation, params } => {
                let input = ctx.data().matrix().clone();
                let execution = ctx.execution();
                let key = self.memory_key();

                let (pre_activation, previous) = {
                    let p = params.lock().map_err(|_| {
                        GraphError::Precondition("параметры слоя отравлены".to_string())
                    })?;
                    let previous = if ctx.batch_type() == MiniBatchType::SequenceStart {
                        // начало последовательности: состояние сеется из
                        // обучаемого начального вектора
                        seed_state(&p.initial_state, input.row_count())
                    } else {
                        match execution.get_memory(&key) {
                            Some(state) => state,
                            None => seed_state(&p.initial_state, input.row_count()),
                        }
                    };
                    let pre = input
                        .multiply(&p.input_weight)
                        .add(&previous.multiply(&p.hidden_weight))
                        .add_to_each_row(&p.bias);
                    (pre, previous)
                };

                // пре-активация уходит в кэш преобразований запуска;
                // обратный проход читает ее оттуда по идентификатору
                let transform_id = execution.next_transform_id();
                execution.set_input_transform(transform_id, pre_activation.clone());

                let state = activation.apply(&pre_activation);
                execution.set_memory(&key, Some(state.clone()));

                let backprop = Backpropagation::Recurrent {
                    activation: *activation,
                    params: Arc::clone(params),
                    input,
                    previous,
                    transform_id,
                    sequence_start: ctx.batch_type() == MiniBatchType::SequenceStart,
                };
                Ok((super::GraphData::Single(state), Some(backprop)))
            }
        }
    }
}

/// Разворачивает вектор начального состояния в матрицу батча.
fn seed_state(initial: &Vector, rows: usize) -> Matrix {
    let row: Vec<f32> = initial.as_array().to_vec();
    Matrix::from_rows(&vec![row; rows])
}
