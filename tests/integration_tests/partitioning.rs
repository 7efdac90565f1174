use geostream::model::query::QueryPlanBuilder;

use crate::setup::{cars, eventually, rect, region, tuple, Cluster, QUIET_PERIOD, RESULT_TIMEOUT};

const WEST: [f64; 4] = [-1000.0, 50.0, -1000.0, 1000.0];
const EAST: [f64; 4] = [50.0, 1000.0, -1000.0, 1000.0];

#[tokio::test]
async fn regions_on_one_node_share_a_subscription() {
    let cluster = Cluster::start(1).await.unwrap();
    let node = cluster.node(0);
    let owner = node.local_node().clone();
    cluster.announce(region(1, rect(&WEST), &owner));
    cluster.announce(region(2, rect(&EAST), &owner));

    let plan = QueryPlanBuilder::range(cars(), rect(&[0.0, 100.0, 0.0, 100.0])).build().unwrap();
    let (id, mut results) = node.register(plan).await.unwrap();
    assert_eq!(node.queries().subscriptions(id), vec![owner]);

    node.insert(&cars(), tuple("west", &[10.0, 11.0, 10.0, 11.0])).await.unwrap();
    node.insert(&cars(), tuple("east", &[60.0, 61.0, 10.0, 11.0])).await.unwrap();
    let mut keys = Vec::new();
    for _ in 0..2 {
        let result = results.next_timeout(RESULT_TIMEOUT).await.expect("No result arrived");
        keys.push(result.first().unwrap().key.clone());
    }
    keys.sort();
    assert_eq!(keys, vec!["east", "west"]);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn new_overlapping_region_is_subscribed_to() {
    let cluster = Cluster::start(2).await.unwrap();
    let west_owner = cluster.node(0).local_node().clone();
    let east_owner = cluster.node(1).local_node().clone();
    cluster.announce(region(1, rect(&WEST), &west_owner));

    let client = cluster.node(0);
    let plan = QueryPlanBuilder::range(cars(), rect(&[0.0, 100.0, 0.0, 100.0])).build().unwrap();
    let (id, mut results) = client.register(plan).await.unwrap();
    assert_eq!(client.queries().subscriptions(id), vec![west_owner.clone()]);

    cluster.announce(region(2, rect(&EAST), &east_owner));
    assert!(eventually(|| client.queries().subscriptions(id).len() == 2).await);
    let mut subscribed = client.queries().subscriptions(id);
    subscribed.sort();
    let mut expected = vec![west_owner, east_owner];
    expected.sort();
    assert_eq!(subscribed, expected);

    client.insert(&cars(), tuple("east", &[60.0, 61.0, 10.0, 11.0])).await.unwrap();
    let result = results.next_timeout(RESULT_TIMEOUT).await.expect("No result arrived");
    assert_eq!(result.first().unwrap().key, "east");
    assert_eq!(cluster.node(1).storage().stores_of(&cars()).len(), 1);
    assert!(results.next_timeout(QUIET_PERIOD).await.is_none());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn regions_outside_the_query_are_not_subscribed_to() {
    let cluster = Cluster::start(2).await.unwrap();
    let west_owner = cluster.node(0).local_node().clone();
    let east_owner = cluster.node(1).local_node().clone();
    cluster.announce(region(1, rect(&WEST), &west_owner));

    let client = cluster.node(0);
    let plan = QueryPlanBuilder::range(cars(), rect(&[0.0, 10.0, 0.0, 10.0])).build().unwrap();
    let (id, _results) = client.register(plan).await.unwrap();

    cluster.announce(region(2, rect(&EAST), &east_owner));
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(client.queries().subscriptions(id), vec![west_owner]);
    assert_eq!(client.queries().registered_regions(id).unwrap().len(), 1);
    cluster.shutdown().await.unwrap();
}
