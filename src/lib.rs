//! Очередь задач с ограничением параллелизма поверх tokio
//!
//! # Features
//! - Enqueue из любого потока, до и во время обработки
//! - Не больше `max_concurrency` обработчиков одновременно
//! - Сквозные номера элементов и живые счетчики прогресса
//! - Ошибка одного воркера не останавливает остальных
//! - Опциональный рост пула воркеров по мере роста очереди

pub mod errors;
pub mod handle;
pub mod model;
pub mod processor;

pub use errors::{ConfigError, RunResult, WorkerError};
pub use handle::RunHandle;
pub use model::{ProcessorMetrics, RunReport, WorkerSizing};
pub use processor::{BoundedWorkProcessor, Config, Processor};
