mod common;

use common::{assert_body, clock_tick, random_id, random_value, TestCluster};

#[tokio::test]
async fn status_is_always_ok() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    let response = cluster
        .client
        .get(format!("{}/v0/status", cluster.url(0)))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    cluster.shutdown().await
}

#[tokio::test]
async fn entity_lifecycle_put_get_overwrite_delete() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    let id = random_id();

    assert_eq!(cluster.get(0, &id, None).await?.status().as_u16(), 404);

    assert_eq!(cluster.put(0, &id, &b"v1"[..], None).await?.status().as_u16(), 201);
    assert_body(cluster.get(0, &id, None).await?, b"v1").await?;

    clock_tick().await;
    assert_eq!(cluster.put(0, &id, &b"v2"[..], None).await?.status().as_u16(), 201);
    assert_body(cluster.get(0, &id, None).await?, b"v2").await?;

    clock_tick().await;
    assert_eq!(cluster.delete(0, &id, None).await?.status().as_u16(), 202);
    assert_eq!(cluster.get(0, &id, None).await?.status().as_u16(), 404);

    cluster.shutdown().await
}

#[tokio::test]
async fn empty_and_missing_id_are_rejected() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;

    for method_url in [
        format!("{}/v0/entity?id=", cluster.url(0)),
        format!("{}/v0/entity", cluster.url(0)),
    ] {
        assert_eq!(cluster.client.get(&method_url).send().await?.status().as_u16(), 400);
        assert_eq!(
            cluster
                .client
                .put(&method_url)
                .body(&b"v"[..])
                .send()
                .await?
                .status()
                .as_u16(),
            400
        );
        assert_eq!(
            cluster.client.delete(&method_url).send().await?.status().as_u16(),
            400
        );
    }
    cluster.shutdown().await
}

#[tokio::test]
async fn unknown_paths_are_rejected() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;

    for path in ["/", "/v0", "/v0/entities", "/v1/entity?id=x", "/abracadabra"] {
        let response = cluster
            .client
            .get(format!("{}{path}", cluster.url(0)))
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 400, "path {path}");
    }
    cluster.shutdown().await
}

#[tokio::test]
async fn malformed_replicas_are_rejected_without_touching_storage() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    let id = random_id();

    for replicas in ["11", "a/1", "1/a", "0/1", "2/1"] {
        let url = format!("{}/v0/entity?id={id}&replicas={replicas}", cluster.url(0));
        assert_eq!(
            cluster
                .client
                .put(&url)
                .body(&b"v"[..])
                .send()
                .await?
                .status()
                .as_u16(),
            400,
            "replicas {replicas}"
        );
    }
    // from > cluster_size
    assert_eq!(
        cluster.put(0, &id, &b"v"[..], Some((1, 2))).await?.status().as_u16(),
        400
    );
    // Nothing was written by any of the rejected requests.
    assert_eq!(cluster.get(0, &id, None).await?.status().as_u16(), 404);

    cluster.shutdown().await
}

#[tokio::test]
async fn empty_value_round_trips() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    let id = random_id();

    assert_eq!(cluster.put(0, &id, Vec::new(), None).await?.status().as_u16(), 201);
    let response = cluster.get(0, &id, None).await?;
    assert_eq!(response.status().as_u16(), 200);
    assert_body(response, b"").await?;

    cluster.shutdown().await
}

#[tokio::test]
async fn delete_of_absent_key_is_accepted() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;
    let id = random_id();

    assert_eq!(cluster.delete(0, &id, None).await?.status().as_u16(), 202);
    assert_eq!(cluster.get(0, &id, None).await?.status().as_u16(), 404);

    cluster.shutdown().await
}

#[tokio::test]
async fn data_survives_a_restart() -> anyhow::Result<()> {
    let mut cluster = TestCluster::start(1).await?;
    let id = random_id();
    let value = random_value();

    assert_eq!(
        cluster.put(0, &id, value.clone(), None).await?.status().as_u16(),
        201
    );
    cluster.restart(0).await?;
    assert_body(cluster.get(0, &id, None).await?, &value).await?;

    cluster.shutdown().await
}

#[tokio::test]
async fn delete_survives_a_restart() -> anyhow::Result<()> {
    let mut cluster = TestCluster::start(1).await?;
    let id = random_id();

    assert_eq!(cluster.put(0, &id, random_value(), None).await?.status().as_u16(), 201);
    clock_tick().await;
    assert_eq!(cluster.delete(0, &id, None).await?.status().as_u16(), 202);
    cluster.restart(0).await?;
    assert_eq!(cluster.get(0, &id, None).await?.status().as_u16(), 404);

    cluster.shutdown().await
}

#[tokio::test]
async fn many_entities_round_trip() -> anyhow::Result<()> {
    let cluster = TestCluster::start(1).await?;

    let pairs: Vec<(String, Vec<u8>)> =
        (0..50).map(|_| (random_id(), random_value())).collect();
    for (id, value) in &pairs {
        assert_eq!(
            cluster.put(0, id, value.clone(), None).await?.status().as_u16(),
            201
        );
    }
    for (id, value) in &pairs {
        assert_body(cluster.get(0, id, None).await?, value).await?;
    }
    cluster.shutdown().await
}
