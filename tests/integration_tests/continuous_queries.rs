use geostream::model::query::{Polarity, QueryPlanBuilder};
use geostream::model::{Hyperrectangle, TableName};
use std::time::Duration;

use crate::setup::{cars, rect, roads, tuple, Cluster, QUIET_PERIOD, RESULT_TIMEOUT};

fn range_query(polarity: Polarity) -> geostream::model::query::QueryPlan {
    QueryPlanBuilder::range(cars(), rect(&[0.0, 10.0, 0.0, 10.0]))
        .polarity(polarity)
        .build()
        .unwrap()
}

#[tokio::test]
async fn positive_range_query_reports_tuples_inside() {
    let cluster = Cluster::single().await.unwrap();
    let node = cluster.node(0);
    let (_, mut results) = node.register(range_query(Polarity::ReportPositive)).await.unwrap();

    node.insert(&cars(), tuple("inside", &[1.0, 2.0, 1.0, 2.0])).await.unwrap();
    let result = results.next_timeout(RESULT_TIMEOUT).await.expect("No result arrived");
    assert_eq!(result.tables, vec![cars()]);
    assert_eq!(result.first().unwrap().key, "inside");

    node.insert(&cars(), tuple("outside", &[50.0, 60.0, 50.0, 60.0])).await.unwrap();
    assert!(results.next_timeout(QUIET_PERIOD).await.is_none());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn negative_range_query_reports_tuples_outside() {
    let cluster = Cluster::single().await.unwrap();
    let node = cluster.node(0);
    let (_, mut results) = node.register(range_query(Polarity::ReportNegative)).await.unwrap();

    node.insert(&cars(), tuple("inside", &[1.0, 2.0, 1.0, 2.0])).await.unwrap();
    node.insert(&cars(), tuple("outside", &[50.0, 60.0, 50.0, 60.0])).await.unwrap();
    let result = results.next_timeout(RESULT_TIMEOUT).await.expect("No result arrived");
    assert_eq!(result.first().unwrap().key, "outside");
    assert!(results.next_timeout(QUIET_PERIOD).await.is_none());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn spatial_join_pairs_stream_tuples_with_stored_ones() {
    let cluster = Cluster::single().await.unwrap();
    let node = cluster.node(0);
    node.insert(&roads(), tuple("main-street", &[0.0, 5.0, 0.0, 5.0])).await.unwrap();
    node.insert(&roads(), tuple("far-road", &[80.0, 90.0, 80.0, 90.0])).await.unwrap();

    let plan = QueryPlanBuilder::spatial_join(cars(), roads(), rect(&[0.0, 10.0, 0.0, 10.0]))
        .build()
        .unwrap();
    let (_, mut results) = node.register(plan).await.unwrap();

    node.insert(&cars(), tuple("car", &[1.0, 2.0, 1.0, 2.0])).await.unwrap();
    let result = results.next_timeout(RESULT_TIMEOUT).await.expect("No result arrived");
    let keys = result.tuples.iter().map(|t| t.key.as_str()).collect::<Vec<_>>();
    assert_eq!(keys, vec!["car", "main-street"]);
    assert_eq!(result.tables, vec![cars(), roads()]);
    assert!(results.next_timeout(QUIET_PERIOD).await.is_none());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_queries_stop_delivering() {
    let cluster = Cluster::single().await.unwrap();
    let node = cluster.node(0);
    let (id, mut results) = node.register(range_query(Polarity::ReportPositive)).await.unwrap();
    assert_eq!(node.queries().active_queries(), 1);

    assert!(node.cancel(id).await.unwrap());
    assert!(!node.cancel(id).await.unwrap());
    assert_eq!(node.queries().active_queries(), 0);

    node.insert(&cars(), tuple("late", &[1.0, 2.0, 1.0, 2.0])).await.unwrap();
    let closed = tokio::time::timeout(RESULT_TIMEOUT, results.next()).await.unwrap();
    assert!(closed.is_none());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn queries_on_unknown_groups_are_rejected() {
    let cluster = Cluster::single().await.unwrap();
    let table = TableName::new("unknown", "cars");
    let plan = QueryPlanBuilder::range(table, Hyperrectangle::full_space()).build().unwrap();
    assert!(cluster.node(0).register(plan).await.is_err());
    assert_eq!(cluster.node(0).queries().active_queries(), 0);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn queries_on_unknown_tables_are_rejected() {
    let cluster = Cluster::single().await.unwrap();
    let table = TableName::new("osm", "trucks");
    let plan = QueryPlanBuilder::range(table, Hyperrectangle::full_space()).build().unwrap();
    let err = cluster.node(0).register(plan).await.unwrap_err();
    assert!(format!("{err:#}").contains("osm_trucks"), "{err:#}");
    assert_eq!(cluster.node(0).queries().active_queries(), 0);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn registering_a_live_id_again_fails() {
    let cluster = Cluster::single().await.unwrap();
    let node = cluster.node(0);
    let plan = range_query(Polarity::ReportPositive);
    let (_, _results) = node.register(plan.clone()).await.unwrap();
    assert!(node.register(plan).await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.queries().active_queries(), 1);
    cluster.shutdown().await.unwrap();
}
