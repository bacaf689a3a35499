pub mod sfu_routes;
pub mod sfu_websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::sfu::SfuServer;

/// Serves every route on `127.0.0.1` with an OS-assigned port.
pub fn bind_ephemeral(sfu_server: Arc<SfuServer>) -> (SocketAddr, JoinHandle<()>) {
    let (addr, server) = warp::serve(sfu_routes::routes(sfu_server)).bind_ephemeral(([127, 0, 0, 1], 0));
    (addr, tokio::spawn(server))
}
