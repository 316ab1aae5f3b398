//! Граф исполнения и движок обхода.
//!
//! Движок снимает операции с FIFO-очереди контекста выполнения: каждая
//! операция активирует узел на текущих данных, выход узла планируется
//! для последователей, а замыкание обратного распространения
//! записывается в трассу прямого прохода. Обратный проход идет по
//! трассе в обратном порядке узлов, суммируя вклады градиента при
//! ветвлении.
//!
//! Для последовательных батчей обратный проход каждого шага
//! откладывается на стек контекста обучения и разворачивается от
//! последнего шага к первому (`backpropagate_through_time`).

use super::backprop::Backpropagation;
use super::context::Context;
use super::execution::{ExecutionContext, GraphOperation};
use super::learning::LearningContext;
use super::node::{Node, NodeOp};
use super::{GraphData, GraphError, GraphResult, NodeId};
use crate::data::{DataSource, MiniBatch, MiniBatchType};
use std::collections::HashMap;
use std::sync::Arc;

/// Трасса прямого прохода: узлы в порядке активации вместе с их
/// замыканиями обратного распространения.
pub type ForwardTrace = Vec<(NodeId, Option<Backpropagation>)>;

/// Направленный граф вычислений.
///
/// Узлы одно-входовые: у каждого узла не больше одного входящего ребра,
/// ветвление допустимо только по выходу. Первый добавленный узел
/// становится входом графа, если вход не назначен явно.
pub struct Graph {
    nodes: Vec<Node>,
    wires: Vec<Vec<NodeId>>,
    predecessor: Vec<Option<NodeId>>,
    input: Option<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            wires: Vec::new(),
            predecessor: Vec::new(),
            input: None,
        }
    }

    /// Добавляет узел и возвращает его идентификатор.
    pub fn add_node(&mut self, name: Option<&str>, op: NodeOp) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            name: name.map(|n| n.to_string()),
            op,
        });
        self.wires.push(Vec::new());
        self.predecessor.push(None);
        if self.input.is_none() {
            self.input = Some(id);
        }
        id
    }

    /// Проводит ребро `from → to`.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> GraphResult<()> {
        if from >= self.nodes.len() {
            return Err(GraphError::NodeNotFound(from));
        }
        if to >= self.nodes.len() {
            return Err(GraphError::NodeNotFound(to));
        }
        if self.predecessor[to].is_some() {
            return Err(GraphError::Unsupported(format!(
                "узел {} уже имеет входящее ребро",
                to
            )));
        }
        self.wires[from].push(to);
        self.predecessor[to] = Some(from);
        Ok(())
    }

    /// Назначает входной узел графа.
    pub fn set_input(&mut self, id: NodeId) -> GraphResult<()> {
        if id >= self.nodes.len() {
            return Err(GraphError::NodeNotFound(id));
        }
        self.input = Some(id);
        Ok(())
    }

    pub fn input(&self) -> Option<NodeId> {
        self.input
    }

    pub fn node(&self, id: NodeId) -> GraphResult<&Node> {
        self.nodes.get(id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Поиск узла по имени.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.wires[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Движок: прямой обход через очередь операций, обратный — по трассе.
pub struct Engine {
    graph: Arc<Graph>,
}

impl Engine {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Прямой проход одного временного шага: заводит вход в очередь и
    /// доводит обход до пустой очереди. Возвращает выход графа и трассу.
    pub fn forward_step(
        &self,
        execution: &Arc<ExecutionContext>,
        input: GraphData,
        batch_type: MiniBatchType,
        step: usize,
    ) -> GraphResult<(GraphData, ForwardTrace)> {
        let input_node = self.graph.input.ok_or(GraphError::MissingInput)?;
        execution.enqueue(GraphOperation {
            node: input_node,
            data: input,
            batch_type,
            step,
        });

        let mut trace: ForwardTrace = Vec::new();
        let mut output = None;
        while let Some(op) = execution.dequeue() {
            let node = self.graph.node(op.node)?;
            let mut ctx = Context::new(
                op.node,
                op.data,
                op.batch_type,
                op.step,
                Arc::clone(execution),
            );
            let (out, backprop) = node.forward(&ctx)?;
            trace.push((op.node, backprop));

            let successors = self.graph.successors(op.node);
            if successors.is_empty() {
                // сток графа: его выход — результат шага
                output = Some(out);
            } else {
                for &next in successors {
                    ctx.add_next(GraphOperation {
                        node: next,
                        data: out.clone(),
                        batch_type: op.batch_type,
                        step: op.step,
                    });
                }
            }
            ctx.flush();
        }

        let output = output.ok_or(GraphError::MissingInput)?;
        Ok((output, trace))
    }

    /// Обратный проход по трассе с заданным сигналом ошибки на выходе.
    /// Возвращает градиент по входу графа.
    pub fn backward_step(
        &self,
        trace: ForwardTrace,
        error: &GraphData,
        execution: &ExecutionContext,
        learning: &mut LearningContext,
    ) -> GraphResult<GraphData> {
        backward_walk(&self.graph, trace, error, execution, learning)
    }

    /// Одна эпоха обучения: корзины → мини-батчи → шаги. Возвращает
    /// среднеквадратичную ошибку эпохи (если ее расчет включен).
    pub fn train(
        &self,
        source: &dyn DataSource,
        execution: &Arc<ExecutionContext>,
        learning: &mut LearningContext,
    ) -> GraphResult<f32> {
        learning.start_epoch();
        let mut squared_error = 0.0;
        let mut value_count = 0usize;

        for bucket in source.get_buckets() {
            for rows in bucket.chunks(learning.batch_size().max(1)) {
                let batch = source.get(rows)?;
                let (sse, count) = self.train_batch(&batch, execution, learning)?;
                squared_error += sse;
                value_count += count;
                // полный обход батча завершен: применяем накопленное
                learning.apply_updates();
                learning.set_row_count(learning.row_count() + batch.len());
            }
        }

        let rows_processed = learning.row_count();
        learning.end_epoch();
        let epoch_error = if value_count > 0 {
            squared_error / value_count as f32
        } else {
            0.0
        };
        log::info!(
            "эпоха {}: {} строк за {:.2} с, ошибка {:.6}",
            learning.current_epoch(),
            rows_processed,
            learning.epoch_seconds(),
            epoch_error
        );
        Ok(epoch_error)
    }

    fn train_batch(
        &self,
        batch: &MiniBatch,
        execution: &Arc<ExecutionContext>,
        learning: &mut LearningContext,
    ) -> GraphResult<(f32, usize)> {
        let mut squared_error = 0.0;
        let mut value_count = 0usize;

        for (step_index, step) in batch.steps().iter().enumerate() {
            let (output, trace) = self.forward_step(
                execution,
                GraphData::Single(step.input.clone()),
                step.batch_type,
                step_index,
            )?;

            let Some(target) = &step.target else {
                continue;
            };
            let error_matrix = target.subtract(output.matrix());
            if learning.calculate_training_error() {
                squared_error += error_matrix.as_array().iter().map(|v| v * v).sum::<f32>();
                value_count += error_matrix.row_count() * error_matrix.column_count();
            }
            let error = GraphData::Single(error_matrix);

            if batch.is_sequential() {
                // обратный проход шага откладывается и развернется от
                // последнего шага к первому
                let graph = Arc::clone(&self.graph);
                let execution = Arc::clone(execution);
                learning.defer_backpropagation(
                    error,
                    Box::new(move |signal, learning| {
                        if let Err(err) =
                            backward_walk(&graph, trace, signal, &execution, learning)
                        {
                            log::error!("отложенный обратный проход не выполнен: {}", err);
                        }
                    }),
                );
            } else {
                backward_walk(&self.graph, trace, &error, execution, learning)?;
            }
        }

        Ok((squared_error, value_count))
    }

    /// Инференс: прямой проход по всем батчам источника без применения
    /// градиентов. Трассы отбрасываются, захваченные матрицы
    /// отпускаются при уничтожении замыканий.
    pub fn execute(
        &self,
        source: &dyn DataSource,
        execution: &Arc<ExecutionContext>,
        batch_size: usize,
    ) -> GraphResult<Vec<GraphData>> {
        let mut outputs = Vec::new();
        for bucket in source.get_buckets() {
            for rows in bucket.chunks(batch_size.max(1)) {
                let batch = source.get(rows)?;
                for (step_index, step) in batch.steps().iter().enumerate() {
                    let (output, _trace) = self.forward_step(
                        execution,
                        GraphData::Single(step.input.clone()),
                        step.batch_type,
                        step_index,
                    )?;
                    outputs.push(output);
                }
            }
        }
        Ok(outputs)
    }
}

/// Обратный обход трассы. Сигнал для узла — сумма вкладов его
/// последователей; узлы без замыкания (терминальные на обратном пути)
/// пропускают сигнал без изменений.
fn backward_walk(
    graph: &Graph,
    trace: ForwardTrace,
    error: &GraphData,
    execution: &ExecutionContext,
    learning: &mut LearningContext,
) -> GraphResult<GraphData> {
    let mut signals: HashMap<NodeId, GraphData> = HashMap::new();
    if let Some((last, _)) = trace.last() {
        signals.insert(*last, error.clone());
    }

    let mut input_gradient: Option<GraphData> = None;
    for (node_id, backprop) in trace.into_iter().rev() {
        let Some(signal) = signals.remove(&node_id) else {
            // до узла сигнал не дошел (сток без внешней ошибки)
            continue;
        };
        let gradient = match backprop {
            Some(bp) => bp.backward(&signal, execution, learning)?,
            None => signal,
        };

        match graph.predecessor[node_id] {
            Some(parent) => match signals.remove(&parent) {
                Some(existing) => {
                    signals.insert(parent, accumulate(existing, &gradient));
                }
                None => {
                    signals.insert(parent, gradient);
                }
            },
            None => {
                input_gradient = Some(match input_gradient.take() {
                    Some(existing) => accumulate(existing, &gradient),
                    None => gradient,
                });
            }
        }
    }

    input_gradient.ok_or_else(|| {
        GraphError::Precondition("обратный проход не достиг входа графа".to_string())
    })
}

/// Поэлементная сумма двух носителей одинаковой структуры.
fn accumulate(left: GraphData, right: &GraphData) -> GraphData {
    let sums = left
        .decompose()
        .iter()
        .zip(right.decompose().iter())
        .map(|(a, b)| a.add(b))
        .collect();
    GraphData::compose(sums)
}
