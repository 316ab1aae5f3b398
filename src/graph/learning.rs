//! Контекст обучения: скорость обучения, отложенные обновления весов
//! и стек отложенных обратных проходов (BPTT).
//!
//! Машина состояний эпохи: `start_epoch` → произвольное число `store`
//! вперемешку с прямыми/обратными проходами → `end_epoch`. Отложенный
//! режим позволяет слоям накапливать применение градиентов до завершения
//! полного обхода графа за батч (включая развертку по времени), чтобы
//! частично примененные обновления не портили разделяемые параметры
//! посреди обхода.

use super::GraphData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Отложенное применение градиента: вызывается с сохраненным сигналом
/// ошибки при `apply_updates`/`end_epoch`.
pub type Updater = Box<dyn FnOnce(&GraphData) + Send>;

/// Отложенный обратный проход одного временного шага. Вторым аргументом
/// передается сам контекст обучения: проход регистрирует в нем свои
/// обновления весов.
pub type BpttCallback = Box<dyn FnOnce(&GraphData, &mut LearningContext) + Send>;

/// Конфигурация сессии обучения.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub defer_updates: bool,
    pub calculate_training_error: bool,
    /// Расписание: номер эпохи → новая скорость обучения.
    pub schedule: HashMap<usize, f32>,
}

impl LearningConfig {
    pub fn new(learning_rate: f32, batch_size: usize) -> Self {
        Self {
            learning_rate,
            batch_size,
            defer_updates: true,
            calculate_training_error: true,
            schedule: HashMap::new(),
        }
    }

    pub fn defer_updates(mut self, defer: bool) -> Self {
        self.defer_updates = defer;
        self
    }

    pub fn calculate_training_error(mut self, calculate: bool) -> Self {
        self.calculate_training_error = calculate;
        self
    }

    pub fn schedule_learning_rate(mut self, at_epoch: usize, rate: f32) -> Self {
        self.schedule.insert(at_epoch, rate);
        self
    }
}

/// Состояние одной сессии обучения.
pub struct LearningContext {
    learning_rate: f32,
    batch_size: usize,
    defer_updates: bool,
    calculate_training_error: bool,
    schedule: HashMap<usize, f32>,
    layer_updates: Vec<(GraphData, Updater)>,
    deferred_backpropagation: Vec<(GraphData, BpttCallback)>,
    current_epoch: usize,
    row_count: usize,
    epoch_start: Option<Instant>,
    epoch_elapsed: Duration,
}

impl LearningContext {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            batch_size: config.batch_size,
            defer_updates: config.defer_updates,
            calculate_training_error: config.calculate_training_error,
            schedule: config.schedule,
            layer_updates: Vec::new(),
            deferred_backpropagation: Vec::new(),
            current_epoch: 0,
            row_count: 0,
            epoch_start: None,
            epoch_elapsed: Duration::ZERO,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, rate: f32) {
        self.learning_rate = rate;
    }

    /// Скорость обучения, нормированная на размер батча.
    pub fn batch_learning_rate(&self) -> f32 {
        self.learning_rate / self.batch_size as f32
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn defer_updates(&self) -> bool {
        self.defer_updates
    }

    pub fn calculate_training_error(&self) -> bool {
        self.calculate_training_error
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn set_row_count(&mut self, row_count: usize) {
        self.row_count = row_count;
    }

    /// Миллисекунды с начала текущей (или длительность последней) эпохи.
    pub fn epoch_ms(&self) -> u128 {
        match self.epoch_start {
            Some(start) => start.elapsed().as_millis(),
            None => self.epoch_elapsed.as_millis(),
        }
    }

    pub fn epoch_seconds(&self) -> f64 {
        self.epoch_ms() as f64 / 1000.0
    }

    /// Назначает новую скорость обучения начиная с эпохи `at_epoch`.
    pub fn schedule_learning_rate(&mut self, at_epoch: usize, rate: f32) {
        self.schedule.insert(at_epoch, rate);
    }

    /// Сбрасывает счетчики и накопленное состояние, сохраняя
    /// конфигурацию.
    pub fn clear(&mut self) {
        self.layer_updates.clear();
        self.deferred_backpropagation.clear();
        self.current_epoch = 0;
        self.row_count = 0;
    }

    /// Начинает эпоху: инкремент счетчика выполняется до проверки
    /// расписания, поэтому запись для эпохи N вступает в силу на N-м
    /// вызове. Сбрасывает счетчик строк, перезапускает таймер и
    /// очищает накопленные отложенные действия.
    pub fn start_epoch(&mut self) {
        self.current_epoch += 1;
        if let Some(&rate) = self.schedule.get(&self.current_epoch) {
            self.learning_rate = rate;
            log::info!("скорость обучения изменена на {}", rate);
        }
        self.row_count = 0;
        self.epoch_start = Some(Instant::now());
        self.layer_updates.clear();
        self.deferred_backpropagation.clear();
    }

    /// Завершает эпоху: применяет отложенные обновления и останавливает
    /// таймер.
    pub fn end_epoch(&mut self) {
        self.apply_updates();
        if let Some(start) = self.epoch_start.take() {
            self.epoch_elapsed = start.elapsed();
        }
        self.row_count = 0;
    }

    /// Сохраняет градиент: в отложенном режиме — в список до
    /// `apply_updates`, иначе применяет немедленно.
    pub fn store(&mut self, error: GraphData, updater: Updater) {
        if self.defer_updates {
            self.layer_updates.push((error, updater));
        } else {
            updater(&error);
        }
    }

    /// Разворачивает оставшиеся отложенные обратные проходы и применяет
    /// все накопленные обновления в порядке добавления.
    pub fn apply_updates(&mut self) {
        self.backpropagate_through_time(None);
        let updates = std::mem::take(&mut self.layer_updates);
        for (error, updater) in updates {
            updater(&error);
        }
    }

    /// Откладывает обратный проход одного временного шага (LIFO).
    pub fn defer_backpropagation(&mut self, data: GraphData, callback: BpttCallback) {
        self.deferred_backpropagation.push((data, callback));
    }

    /// Обратное распространение во времени без ограничения глубины.
    pub fn backpropagate_through_time(&mut self, signal: Option<GraphData>) {
        self.backpropagate_through_time_with_depth(signal, usize::MAX);
    }

    /// Снимает со стека до `max_depth` отложенных проходов, начиная с
    /// последнего добавленного. Внешний сигнал получает только первый
    /// снятый проход; остальные работают со своими сохраненными данными.
    /// Стек безусловно очищается по завершении: не развернутые из-за
    /// `max_depth` проходы отбрасываются.
    pub fn backpropagate_through_time_with_depth(
        &mut self,
        signal: Option<GraphData>,
        max_depth: usize,
    ) {
        let mut signal = signal;
        let mut depth = 0;
        while depth < max_depth {
            let Some((data, callback)) = self.deferred_backpropagation.pop() else {
                break;
            };
            match signal.take() {
                Some(external) => callback(&external, self),
                None => callback(&data, self),
            }
            depth += 1;
        }
        if !self.deferred_backpropagation.is_empty() {
            log::warn!(
                "отброшено {} отложенных обратных проходов: достигнут предел глубины {}",
                self.deferred_backpropagation.len(),
                max_depth
            );
            self.deferred_backpropagation.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::Matrix;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn data(value: f32) -> GraphData {
        GraphData::Single(Matrix::new(array![[value]]))
    }

    fn context() -> LearningContext {
        LearningContext::new(LearningConfig::new(0.1, 4))
    }

    #[test]
    fn test_learning_rate_schedule() {
        let mut ctx = context();
        ctx.schedule_learning_rate(3, 0.01);

        ctx.start_epoch();
        assert_eq!(ctx.current_epoch(), 1);
        assert_eq!(ctx.learning_rate(), 0.1);

        ctx.start_epoch();
        assert_eq!(ctx.learning_rate(), 0.1);

        // расписание на эпоху 3 срабатывает на третьем start_epoch
        ctx.start_epoch();
        assert_eq!(ctx.learning_rate(), 0.01);
    }

    #[test]
    fn test_deferred_updates_apply_in_insertion_order() {
        let mut ctx = context();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        ctx.store(
            data(1.0),
            Box::new(move |e| {
                o1.lock().unwrap().push((1, e.matrix().as_array()[[0, 0]]));
            }),
        );
        let o2 = Arc::clone(&order);
        ctx.store(
            data(2.0),
            Box::new(move |e| {
                o2.lock().unwrap().push((2, e.matrix().as_array()[[0, 0]]));
            }),
        );

        ctx.end_epoch();
        assert_eq!(*order.lock().unwrap(), vec![(1, 1.0), (2, 2.0)]);

        // повторный end_epoch без новых store ничего не вызывает
        ctx.end_epoch();
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_immediate_update_when_not_deferred() {
        let mut ctx = LearningContext::new(LearningConfig::new(0.1, 4).defer_updates(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        ctx.store(data(1.0), Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bptt_lifo_with_one_shot_signal() {
        let mut ctx = context();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 1..=3 {
            let s = Arc::clone(&seen);
            ctx.defer_backpropagation(
                data(i as f32),
                Box::new(move |received, _| {
                    s.lock().unwrap().push((i, received.matrix().as_array()[[0, 0]]));
                }),
            );
        }

        ctx.backpropagate_through_time(Some(data(100.0)));

        // LIFO: последний отложенный получает внешний сигнал, остальные —
        // свои сохраненные данные
        assert_eq!(*seen.lock().unwrap(), vec![(3, 100.0), (2, 2.0), (1, 1.0)]);

        // стек пуст: повторный вызов ничего не делает
        ctx.backpropagate_through_time(Some(data(200.0)));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_bptt_max_depth_discards_remainder() {
        let mut ctx = context();
        let calls = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let c = Arc::clone(&calls);
            ctx.defer_backpropagation(data(i as f32), Box::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        ctx.backpropagate_through_time_with_depth(None, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // остаток отброшен, стек очищен
        ctx.backpropagate_through_time(None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_can_store_updates() {
        // отложенный проход регистрирует обновление, которое применяется
        // тем же apply_updates после разворачивания стека
        let mut ctx = context();
        let applied = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&applied);
        ctx.defer_backpropagation(
            data(1.0),
            Box::new(move |_, learning| {
                let a = Arc::clone(&a);
                learning.store(data(9.0), Box::new(move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                }));
            }),
        );

        ctx.apply_updates();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_resets_counters_keeps_config() {
        let mut ctx = context();
        ctx.start_epoch();
        ctx.set_row_count(42);
        ctx.clear();
        assert_eq!(ctx.current_epoch(), 0);
        assert_eq!(ctx.row_count(), 0);
        assert_eq!(ctx.learning_rate(), 0.1);
        assert_eq!(ctx.batch_size(), 4);
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = LearningConfig::new(0.1, 8)
            .defer_updates(false)
            .schedule_learning_rate(5, 0.02);
        let json = serde_json::to_string(&config).unwrap();
        let restored: LearningConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.learning_rate, 0.1);
        assert_eq!(restored.batch_size, 8);
        assert!(!restored.defer_updates);
        assert_eq!(restored.schedule.get(&5), Some(&0.02));
    }

    #[test]
    fn test_epoch_timer_runs() {
        let mut ctx = context();
        ctx.start_epoch();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ctx.end_epoch();
        assert!(ctx.epoch_ms() >= 5);
    }
}
