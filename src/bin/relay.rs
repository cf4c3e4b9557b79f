use peerroom::relay;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<(), peerroom::Error> {
    env_logger::init();
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_owned())
        .parse()
        .expect("listen address expected, e.g. 127.0.0.1:8000");
    relay::serve(addr).await
}
