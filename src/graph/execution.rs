//! Контекст выполнения одного запуска (обучение или инференс).
//!
//! Держит три разделяемых структуры: FIFO-очередь операций, управляющую
//! обходом графа, таблицу памяти по именованным слотам и кэш входных
//! преобразований. Матрица, помещенная в таблицу или кэш, удерживается
//! (+1 к счетчику ссылок) до удаления, перезаписи или освобождения
//! контекста.
//!
//! Все три структуры защищены мьютексами: узлы и отложенные обратные
//! проходы могут обращаться к ним из конкурентно запланированных
//! операций, хотя сам обход в пределах батча логически однопоточен.

use super::{GraphData, NodeId};
use crate::data::MiniBatchType;
use crate::linalg::Matrix;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Одна запланированная операция обхода: активация узла на данных.
#[derive(Debug, Clone)]
pub struct GraphOperation {
    pub node: NodeId,
    pub data: GraphData,
    pub batch_type: MiniBatchType,
    pub step: usize,
}

/// Состояние уровня запуска, разделяемое всеми активациями узлов.
pub struct ExecutionContext {
    operations: Mutex<VecDeque<GraphOperation>>,
    memory: Mutex<HashMap<String, Matrix>>,
    transform_cache: Mutex<HashMap<u64, Matrix>>,
    next_transform_id: AtomicU64,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(VecDeque::new()),
            memory: Mutex::new(HashMap::new()),
            transform_cache: Mutex::new(HashMap::new()),
            next_transform_id: AtomicU64::new(0),
        }
    }

    // --- Очередь операций ---

    /// Ставит операцию в конец очереди.
    pub fn enqueue(&self, operation: GraphOperation) {
        self.operations
            .lock()
            .expect("очередь операций отравлена")
            .push_back(operation);
    }

    /// Ставит группу операций, сохраняя порядок.
    pub fn enqueue_all(&self, operations: Vec<GraphOperation>) {
        let mut queue = self.operations.lock().expect("очередь операций отравлена");
        for op in operations {
            queue.push_back(op);
        }
    }

    /// Снимает операцию с начала очереди. `None` означает, что работы
    /// в этом проходе больше нет — это не ошибка.
    pub fn dequeue(&self) -> Option<GraphOperation> {
        self.operations
            .lock()
            .expect("очередь операций отравлена")
            .pop_front()
    }

    /// Количество операций, ожидающих выполнения.
    pub fn remaining_operations(&self) -> usize {
        self.operations.lock().expect("очередь операций отравлена").len()
    }

    // --- Таблица памяти ---

    /// Читает матрицу из именованного слота. Отсутствие ключа значимо:
    /// «еще не вычислено».
    pub fn get_memory(&self, key: &str) -> Option<Matrix> {
        self.memory
            .lock()
            .expect("таблица памяти отравлена")
            .get(key)
            .cloned()
    }

    /// Записывает слот. `Some` удерживает новую матрицу и отпускает
    /// предыдущую; `None` удаляет ключ, отпуская занимавшую его матрицу.
    pub fn set_memory(&self, key: &str, value: Option<Matrix>) {
        let mut memory = self.memory.lock().expect("таблица памяти отравлена");
        match value {
            Some(matrix) => {
                memory.insert(key.to_string(), matrix);
            }
            None => {
                memory.remove(key);
            }
        }
    }

    // --- Кэш входных преобразований ---

    /// Выделяет свежий идентификатор преобразования для этого запуска.
    pub fn next_transform_id(&self) -> u64 {
        self.next_transform_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Читает кэшированное преобразование.
    pub fn get_input_transform(&self, id: u64) -> Option<Matrix> {
        self.transform_cache
            .lock()
            .expect("кэш преобразований отравлен")
            .get(&id)
            .cloned()
    }

    /// Кэширует преобразование. Записи живут до освобождения контекста.
    pub fn set_input_transform(&self, id: u64, matrix: Matrix) {
        self.transform_cache
            .lock()
            .expect("кэш преобразований отравлен")
            .insert(id, matrix);
    }

    /// Освобождает все удержанные матрицы и очищает обе таблицы и
    /// очередь. Повторный вызов — no-op: таблицы уже пусты.
    pub fn dispose(&self) {
        self.operations
            .lock()
            .expect("очередь операций отравлена")
            .clear();
        self.memory.lock().expect("таблица памяти отравлена").clear();
        self.transform_cache
            .lock()
            .expect("кэш преобразований отравлен")
            .clear();
        log::trace!("контекст выполнения освобожден");
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Прерванный запуск обязан отпустить все удержанные матрицы.
        self.dispose();
    }
}
