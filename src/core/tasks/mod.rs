pub mod handle;

pub use handle::{
    CancelToken,
    CancellableTask,
    TaskHandle,
};
