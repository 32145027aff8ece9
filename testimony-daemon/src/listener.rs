//! Control-socket Listener (§4.3): one per configured filesystem socket
//! path.

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{error, info};

use crate::config::SocketConfig;
use crate::fanout::FanoutGroup;
use crate::session::Session;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opens the Fanout Group for `cfg`, binds its control socket (removing
/// any stale file left at the path first, and applying the configured
/// mode afterward, per §4.3/§6.3: path ownership and mode are what govern
/// who may connect), and serves connections until the process exits.
pub async fn serve(cfg: SocketConfig) -> anyhow::Result<()> {
    let group = Arc::new(FanoutGroup::open(&cfg)?);

    if cfg.path.exists() {
        std::fs::remove_file(&cfg.path)?;
    }
    let listener = UnixListener::bind(&cfg.path)?;
    if let Some(mode) = cfg.mode {
        std::fs::set_permissions(&cfg.path, std::fs::Permissions::from_mode(mode))?;
    }
    info!(path = %cfg.path.display(), interface = %cfg.interface, "listening");

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "accept failed");
                continue;
            }
        };

        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let group = Arc::clone(&group);
        tokio::spawn(async move {
            let session = Session::new(stream, group, session_id);
            session.run().await;
        });
    }
}
