use anyhow::Result;
use diff_evaluator::utils::logging;
use diff_evaluator::{App, Config};
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load()?;

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化并运行应用
    let app = App::initialize(config)?;

    let cancel = app.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⏹️ 收到中断信号，完成在途请求后停止");
            cancel.cancel();
        }
    });

    app.run().await?;

    Ok(())
}
