//! Shared dependency context.
//!
//! One `Deps` is wired at startup and handed to every handler, node, and
//! background worker; nothing reads the environment or constructs ambient
//! singletons in hot paths.

use std::sync::Arc;

use crate::config::Settings;
use crate::db::approvals::ApprovalsRepo;
use crate::db::artifacts::ArtifactsRepo;
use crate::db::confirmations::ConfirmationsRepo;
use crate::db::evals::EvalsRepo;
use crate::db::events::EventsRepo;
use crate::db::evidence::EvidenceRepo;
use crate::db::nodes::NodesRepo;
use crate::db::orders::OrdersRepo;
use crate::db::portfolio::PortfolioRepo;
use crate::db::runs::RunsRepo;
use crate::db::telemetry::TelemetryRepo;
use crate::db::Db;
use crate::events::EventBus;
use crate::market_data::MarketData;

#[derive(Clone)]
pub struct Deps {
    pub db: Db,
    pub settings: Arc<Settings>,
    pub bus: EventBus,
    pub market: Arc<dyn MarketData>,
}

impl Deps {
    pub fn new(db: Db, settings: Settings, market: Arc<dyn MarketData>) -> Self {
        let bus = EventBus::new(db.clone());
        Self {
            db,
            settings: Arc::new(settings),
            bus,
            market,
        }
    }

    pub fn runs(&self) -> RunsRepo {
        RunsRepo::new(self.db.clone())
    }

    pub fn nodes(&self) -> NodesRepo {
        NodesRepo::new(self.db.clone())
    }

    pub fn orders(&self) -> OrdersRepo {
        OrdersRepo::new(self.db.clone())
    }

    pub fn confirmations(&self) -> ConfirmationsRepo {
        ConfirmationsRepo::new(self.db.clone())
    }

    pub fn artifacts(&self) -> ArtifactsRepo {
        ArtifactsRepo::new(self.db.clone())
    }

    pub fn evidence(&self) -> EvidenceRepo {
        EvidenceRepo::new(self.db.clone())
    }

    pub fn portfolio(&self) -> PortfolioRepo {
        PortfolioRepo::new(self.db.clone())
    }

    pub fn approvals(&self) -> ApprovalsRepo {
        ApprovalsRepo::new(self.db.clone())
    }

    pub fn evals(&self) -> EvalsRepo {
        EvalsRepo::new(self.db.clone())
    }

    pub fn events(&self) -> EventsRepo {
        EventsRepo::new(self.db.clone())
    }

    pub fn telemetry(&self) -> TelemetryRepo {
        TelemetryRepo::new(self.db.clone())
    }
}
