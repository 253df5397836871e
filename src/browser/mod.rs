pub mod manager;
pub mod pool;
pub mod storage_state;
