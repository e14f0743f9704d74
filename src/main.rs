// 命令行入口

#[tokio::main]
async fn main() {
    if dialogue_analyzer_lib::run().await.is_err() {
        std::process::exit(1);
    }
}
