pub mod diagnostics;
pub mod import;
pub mod primitives;
pub mod symbology;
pub mod synthesis;
pub mod target;
pub mod walker;

pub mod errors {
    use thiserror::Error;

    use crate::target::StoreError;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("entity with id {0:X} not found")]
        MissingEntity(u64),
        #[error("block definition with id {0:X} not found")]
        MissingBlock(u64),
        #[error("block definition {0:X} references itself")]
        RecursiveBlock(u64),
        #[error("conversion cancelled")]
        Cancelled,
        #[error(transparent)]
        Store(#[from] StoreError),
    }
}

pub mod cancel {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::errors::EngineError;

    /// 协作式取消标志，可跨线程克隆共享。
    #[derive(Debug, Clone, Default)]
    pub struct CancellationToken(Arc<AtomicBool>);

    impl CancellationToken {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }

        #[inline]
        pub fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        #[inline]
        pub fn check(&self) -> Result<(), EngineError> {
            if self.is_cancelled() {
                Err(EngineError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}
