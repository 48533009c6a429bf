// SPDX-License-Identifier: GPL-2.0-or-later

use std::io;
use std::net::TcpListener;
use std::path::PathBuf;

use axum::Router;
use tower_http::services::ServeDir;
use tracing::{error, info};

/// Embedded static-file server for guest-side downloads. Serves `root` on a
/// background thread for the rest of the process lifetime.
pub struct HttpServer {
    pub listen: String,
    pub port: u16,
    pub root: PathBuf,
}

impl HttpServer {
    /// Bind synchronously so address errors surface to the session, then
    /// serve from a dedicated current-thread runtime.
    pub fn start(self) -> io::Result<()> {
        let listener = TcpListener::bind((self.listen.as_str(), self.port))?;
        listener.set_nonblocking(true)?;

        info!(
            "HTTP server started on {}:{}, serving {}",
            self.listen,
            self.port,
            self.root.display()
        );

        let root = self.root;
        std::thread::Builder::new()
            .name("http-serve".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!("http server runtime failed: {err}");
                        return;
                    }
                };

                runtime.block_on(async move {
                    let app = Router::new().fallback_service(ServeDir::new(root));
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(l) => l,
                        Err(err) => {
                            error!("http server listener failed: {err}");
                            return;
                        }
                    };
                    if let Err(err) = axum::serve(listener, app).await {
                        error!("http server failed: {err}");
                    }
                });
            })?;

        Ok(())
    }
}
