use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cucumber::World;
use pgmirror::testing::FakeDriver;
use pgmirror::{
    ConnectionParams, ConnectorEvent, CorrelationId, DatabaseConnector, NotificationDisposition,
    NotificationRouter, Row, TableManager,
};
use tokio::sync::mpsc;

mod steps;

#[derive(World)]
#[world(init = Self::new)]
pub struct MirrorWorld {
    pub driver: FakeDriver,
    pub connector: Arc<DatabaseConnector>,
    pub router: Arc<NotificationRouter>,
    /// Managers by table name
    pub managers: HashMap<String, Arc<TableManager>>,
    pub connector_events: Option<mpsc::UnboundedReceiver<ConnectorEvent>>,
    /// Submitted commands by label, in submission order
    pub submitted: Vec<(String, CorrelationId)>,
    pub finished: Vec<CorrelationId>,
    pub reload: Option<(String, CorrelationId, Vec<Row>)>,
    /// Last notification's effect, per table
    pub dispositions: Vec<(String, NotificationDisposition)>,
}

impl MirrorWorld {
    fn new() -> Self {
        let driver = FakeDriver::new();
        let connector = Arc::new(DatabaseConnector::with_params(
            Arc::new(driver.clone()),
            ConnectionParams::new("localhost", 5432, "app"),
        ));
        Self {
            driver,
            connector,
            router: Arc::new(NotificationRouter::new()),
            managers: HashMap::new(),
            connector_events: None,
            submitted: Vec::new(),
            finished: Vec::new(),
            reload: None,
            dispositions: Vec::new(),
        }
    }

    pub fn manager(&self, table: &str) -> Arc<TableManager> {
        match self.managers.get(table) {
            Some(manager) => Arc::clone(manager),
            None => panic!("no mirror for table {}", table),
        }
    }
}

impl fmt::Debug for MirrorWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorWorld")
            .field("connector", &self.connector)
            .field("tables", &self.managers.keys().collect::<Vec<_>>())
            .field("submitted", &self.submitted)
            .field("finished", &self.finished)
            .finish()
    }
}

#[tokio::main]
async fn main() {
    MirrorWorld::cucumber().run_and_exit("tests/features").await;
}
