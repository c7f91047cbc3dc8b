//! Collection of per-URI SMTP servers, run as one [`Worker`] (spec.md
//! §4.7). Grounded on `original_source/listener/smtp/smtp.go`'s
//! `NewSMTP`/`Serve`: build one server per configured listener URI, start
//! them concurrently, block on cancellation, let each server drain.

use crate::error::Result;
use crate::process::Worker;
use crate::smtp::server::Server;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct Fleet {
    servers: Vec<Server>,
}

impl Fleet {
    pub fn new(servers: Vec<Server>) -> Self {
        Fleet { servers }
    }
}

#[async_trait]
impl Worker for Fleet {
    fn name(&self) -> &str {
        "SMTP"
    }

    async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let runs = self.servers.iter().map(|server| async {
            let uri = server.uri().to_string();
            if let Err(e) = server.serve(cancel.clone()).await {
                error!(listener = uri, error = %e, "SMTP server stopped with error");
            }
        });

        futures::future::join_all(runs).await;
        Ok(())
    }
}
