use anyhow::Result;

pub mod agent;
pub mod monitor;
pub mod repair;
pub mod start;
pub mod stop;
pub mod submit;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}
