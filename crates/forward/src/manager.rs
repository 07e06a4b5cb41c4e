use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{ForwardError, Result};
use crate::rule::ForwardRule;
use crate::session::{SessionConnector, TransportSession};
use crate::tcp::{Forwarder, ForwarderHandle};

/// Everything needed to bring up one client: how to reach it and what to forward.
#[derive(Debug, Clone)]
pub struct ClientPlan<P> {
    /// Label used in logs and errors.
    pub name: String,
    pub params: P,
    pub rules: Vec<ForwardRule>,
}

/// Owns one transport session per client and one forwarder per rule.
///
/// Sessions are only closed after every forwarder bound to them has stopped.
pub struct SessionManager<S: TransportSession> {
    sessions: Vec<(String, Arc<S>)>,
    forwarders: Vec<ForwarderHandle>,
    cancel: CancellationToken,
}

impl<S: TransportSession> SessionManager<S> {
    /// Establish every session and start every forwarder, in plan order.
    ///
    /// The first failure (session establishment or local bind) shuts down
    /// whatever was already started and is returned.
    ///
    /// Cancelling `cancel` stops every forwarder; the manager itself only ever
    /// cancels a child of it.
    pub async fn start<C, I>(connector: &C, plans: I, cancel: CancellationToken) -> Result<Self>
    where
        C: SessionConnector<Session = S>,
        I: IntoIterator<Item = ClientPlan<C::Params>>,
    {
        let mut manager = Self {
            sessions: Vec::new(),
            forwarders: Vec::new(),
            cancel: cancel.child_token(),
        };

        for plan in plans {
            if let Err(e) = manager.start_client(connector, plan).await {
                manager.shutdown().await;
                return Err(e);
            }
        }

        Ok(manager)
    }

    #[instrument(skip_all, fields(client = %plan.name))]
    async fn start_client<C>(&mut self, connector: &C, plan: ClientPlan<C::Params>) -> Result<()>
    where
        C: SessionConnector<Session = S>,
    {
        info!("establishing session");
        let session = connector
            .connect(&plan.params)
            .await
            .map_err(|e| ForwardError::Session {
                client: plan.name.clone(),
                message: e.to_string(),
            })?;
        let session = Arc::new(session);
        self.sessions.push((plan.name.clone(), session.clone()));

        for rule in plan.rules {
            let handle = Forwarder::start(rule, session.clone(), self.cancel.child_token()).await?;
            self.forwarders.push(handle);
        }

        Ok(())
    }

    pub fn forwarders(&self) -> &[ForwarderHandle] {
        &self.forwarders
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Resolves once every forwarder has stopped on its own.
    pub async fn wait(&self) {
        for forwarder in &self.forwarders {
            forwarder.stopped().await;
        }
    }

    /// Stop every forwarder and relay, then close every session.
    pub async fn shutdown(self) {
        info!(
            forwarders = self.forwarders.len(),
            sessions = self.sessions.len(),
            "shutting down"
        );
        self.cancel.cancel();

        for forwarder in self.forwarders {
            let addr = forwarder.local_addr();
            if let Err(e) = forwarder.join().await {
                warn!(%addr, %e, "forwarder ended with error");
            }
        }

        for (name, session) in self.sessions {
            if let Err(e) = session.close().await {
                warn!(client = %name, %e, "failed to close session");
            }
        }
    }
}
