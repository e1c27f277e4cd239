use std::sync::Arc;

use db::{DBService, IdentityStore};
use services::services::{
    federation::FederationService, oauth::OAuthClient, session::SessionStore,
    ticket::TicketService,
};

use crate::{
    config::{BrokerConfig, ConfigError},
    pipeline::route_table::RouteTable,
    routes,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub db: DBService,
    pub tickets: Arc<TicketService>,
    pub sessions: SessionStore,
    pub oauth: Arc<OAuthClient>,
    pub federation: FederationService,
    pub routes: Arc<RouteTable>,
}

impl AppState {
    /// Wire the services around an activated database.
    pub fn new(config: BrokerConfig, db: DBService) -> Result<Self, ConfigError> {
        let registry = Arc::new(config.provider_registry()?);
        let tickets = TicketService::new(&config.ticket_secret, config.ticket_window).map_err(
            |e| ConfigError::InvalidValue {
                key: "BROKER_TICKET_SECRET".to_string(),
                reason: e.to_string(),
            },
        )?;

        let routes = routes::route_table(&registry)?;
        let oauth = OAuthClient::new(registry, config.public_base_url.clone());
        let sessions = SessionStore::new(config.session_idle_timeout);
        let federation = FederationService::new(db.store());

        Ok(Self {
            config: Arc::new(config),
            db,
            tickets: Arc::new(tickets),
            sessions,
            oauth: Arc::new(oauth),
            federation,
            routes: Arc::new(routes),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn IdentityStore> {
        self.db.store()
    }

    pub fn tickets(&self) -> &TicketService {
        &self.tickets
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn oauth(&self) -> Arc<OAuthClient> {
        self.oauth.clone()
    }

    pub fn federation(&self) -> &FederationService {
        &self.federation
    }

    pub fn route_table(&self) -> &RouteTable {
        &self.routes
    }
}
