use crate::MirrorWorld;
use cucumber::{given, then, when};
use pgmirror::testing::{next_matching, EVENT_TIMEOUT};
use pgmirror::{ConnectionState, ConnectorEvent};

#[given("a connected database connection")]
async fn connected(world: &mut MirrorWorld) {
    world.connector_events = Some(world.connector.subscribe());
    world
        .connector
        .connect("app", "secret")
        .await
        .expect("connect to the fake database");
}

#[given(regex = r#"^the connection is busy executing "(.+)"$"#)]
async fn busy_executing(world: &mut MirrorWorld, query: String) {
    world.driver.pause();
    let id = world.connector.submit(query.clone());
    world.submitted.push((query, id));

    let events = world
        .connector_events
        .as_mut()
        .expect("connection is subscribed");
    next_matching(events, EVENT_TIMEOUT, |event| {
        matches!(event, ConnectorEvent::StateChanged(ConnectionState::Busy)).then_some(())
    })
    .await
    .expect("connection went busy");
}

#[when(regex = r#"^I submit "(.+)"$"#)]
async fn submit(world: &mut MirrorWorld, query: String) {
    let id = world.connector.submit(query.clone());
    world.submitted.push((query, id));
}

#[when("the database finishes all work")]
async fn finish_all(world: &mut MirrorWorld) {
    world.driver.resume();
    let expected = world.submitted.len();
    let events = world
        .connector_events
        .as_mut()
        .expect("connection is subscribed");

    while world.finished.len() < expected {
        let id = next_matching(events, EVENT_TIMEOUT, |event| match event {
            ConnectorEvent::QueryFinished(completion) => Some(completion.id),
            _ => None,
        })
        .await
        .expect("command completed");
        world.finished.push(id);
    }
}

#[then(regex = r#"^(\d+) commands? (?:is|are) queued$"#)]
async fn queued(world: &mut MirrorWorld, count: usize) {
    assert_eq!(world.connector.pending_len(), count);
}

#[then(regex = r#"^the completions arrive in the order "(.+)"$"#)]
async fn completion_order(world: &mut MirrorWorld, order: String) {
    let expected: Vec<&str> = order.split(',').map(str::trim).collect();
    let actual: Vec<&str> = world
        .finished
        .iter()
        .map(|id| {
            world
                .submitted
                .iter()
                .find(|(_, submitted)| submitted == id)
                .map(|(label, _)| label.as_str())
                .unwrap_or("<unknown>")
        })
        .collect();
    assert_eq!(actual, expected, "completion order");
}

#[then("no two commands ran at the same time")]
async fn one_at_a_time(world: &mut MirrorWorld) {
    assert_eq!(world.driver.max_concurrency(), 1);
}

#[then("the connection is idle")]
async fn idle(world: &mut MirrorWorld) {
    assert_eq!(world.connector.state(), ConnectionState::Idle);
}
