//! Pool RPC service — exposes a [`WorkerPool`] on the message bus.
//!
//! | Method          | Args             | Reply                          |
//! |-----------------|------------------|--------------------------------|
//! | `createWorker`  | —                | `WorkerGrant` or `{"error"}`   |
//! | `dropWorker`    | `{workerId}`     | `{"dropped": bool}`            |
//! | `isWorkerAlive` | `{workerId}`     | `bool`                         |
//! | `getPoolInfo`   | —                | `PoolInfo`                     |

use relaygrid_bus::{agent_queue, error_reply, MethodTable, RpcEndpoint, POOL_QUEUE};
use relaygrid_core::{WorkerGrant, WorkerId};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::PoolResult;
use crate::pool::WorkerPool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerArgs {
    worker_id: WorkerId,
}

/// Method table serving `pool`.
pub fn pool_methods(pool: WorkerPool) -> MethodTable {
    let mut methods = MethodTable::new();

    let create = pool.clone();
    methods.register("createWorker", move |_args| {
        let pool = create.clone();
        async move {
            let worker_id = match pool.get_worker().await {
                Ok(worker_id) => worker_id,
                Err(e) => {
                    warn!(agent_id = %pool.agent_id(), error = %e, "createWorker failed");
                    return error_reply(e.to_string());
                }
            };
            pool.fill().await;

            let grant = WorkerGrant {
                worker_id,
                agent_id: pool.agent_id().to_string(),
                worker_id_for_agent: None,
            };
            serde_json::to_value(&grant).unwrap_or_else(|e| error_reply(e.to_string()))
        }
    });

    let dropper = pool.clone();
    methods.register_typed("dropWorker", move |args: WorkerArgs| {
        let pool = dropper.clone();
        async move { json!({ "dropped": pool.drop_worker(&args.worker_id).await }) }
    });

    let alive = pool.clone();
    methods.register_typed("isWorkerAlive", move |args: WorkerArgs| {
        let pool = alive.clone();
        async move { pool.is_worker_alive(&args.worker_id).await }
    });

    methods.register("getPoolInfo", move |_args| {
        let pool = pool.clone();
        async move { serde_json::to_value(pool.info().await).unwrap_or_else(|e| error_reply(e.to_string())) }
    });

    methods
}

/// Serve `pool` on the shared pool queue and the agent's private queue.
pub async fn serve(endpoint: &RpcEndpoint, pool: WorkerPool) -> PoolResult<()> {
    let private = agent_queue(pool.agent_id());
    let agent_id = pool.agent_id().to_string();

    endpoint.add_methods(pool_methods(pool)).await;
    endpoint.bind(POOL_QUEUE).await?;
    endpoint.bind(&private).await?;

    info!(%agent_id, shared = POOL_QUEUE, %private, "pool service bound");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::started_pool;
    use relaygrid_bus::{CallOutcome, MemoryBroker};
    use relaygrid_core::PoolInfo;
    use serde_json::Value;
    use std::sync::Arc;

    async fn client_and_pool(max: usize, prerun: usize) -> (RpcEndpoint, WorkerPool, RpcEndpoint) {
        let broker = MemoryBroker::new();
        let (pool, _launcher) = started_pool(max, prerun).await;

        let server = RpcEndpoint::new(Arc::new(broker.clone()));
        serve(&server, pool.clone()).await.unwrap();

        let client = RpcEndpoint::new(Arc::new(broker));
        client.connect().await.unwrap();
        (client, pool, server)
    }

    fn data(outcome: CallOutcome) -> Value {
        outcome.into_data().expect("call timed out")
    }

    #[tokio::test]
    async fn create_worker_grants_and_refills() {
        let (client, pool, _server) = client_and_pool(3, 1).await;

        let reply = data(client.call(POOL_QUEUE, "createWorker", Value::Null).await.unwrap());
        let grant: WorkerGrant = serde_json::from_value(reply).unwrap();
        assert_eq!(grant.agent_id, "agent-1");
        assert!(pool.is_worker_alive(&grant.worker_id).await);

        let info = pool.info().await;
        assert_eq!((info.idle, info.busy), (1, 1));
    }

    #[tokio::test]
    async fn create_worker_without_capacity_replies_error() {
        let (client, _pool, _server) = client_and_pool(0, 0).await;

        let reply = data(client.call(POOL_QUEUE, "createWorker", Value::Null).await.unwrap());
        assert!(reply["error"].as_str().unwrap().contains("no worker capacity"));
    }

    #[tokio::test]
    async fn private_queue_drops_and_reports_liveness() {
        let (client, pool, _server) = client_and_pool(2, 1).await;
        let worker_id = pool.get_worker().await.unwrap();
        let private = agent_queue("agent-1");

        let alive = data(
            client
                .call(&private, "isWorkerAlive", json!({ "workerId": worker_id }))
                .await
                .unwrap(),
        );
        assert_eq!(alive, json!(true));

        let dropped = data(
            client
                .call(&private, "dropWorker", json!({ "workerId": worker_id }))
                .await
                .unwrap(),
        );
        assert_eq!(dropped, json!({ "dropped": true }));

        let again = data(
            client
                .call(&private, "dropWorker", json!({ "workerId": worker_id }))
                .await
                .unwrap(),
        );
        assert_eq!(again, json!({ "dropped": false }));
    }

    #[tokio::test]
    async fn pool_info_reports_counters() {
        let (client, _pool, _server) = client_and_pool(4, 2).await;

        let reply = data(client.call(POOL_QUEUE, "getPoolInfo", Value::Null).await.unwrap());
        let info: PoolInfo = serde_json::from_value(reply).unwrap();
        assert_eq!(info.idle, 2);
        assert_eq!(info.max_processes, 4);
    }

    #[tokio::test]
    async fn drop_worker_rejects_missing_id() {
        let (client, _pool, _server) = client_and_pool(1, 0).await;

        let reply = data(client.call(POOL_QUEUE, "dropWorker", json!({})).await.unwrap());
        assert!(reply["error"].is_string());
    }
}
