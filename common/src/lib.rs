pub mod common_error;
pub mod thread_pool;

pub type CommonResult<T> = Result<T, common_error::CommonError>;
