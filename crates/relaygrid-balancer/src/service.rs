//! Coordinator RPC service, served on `relay.coordinator`.

use relaygrid_bus::{error_reply, MethodTable, RpcEndpoint, COORDINATOR_QUEUE};
use relaygrid_core::{NodeAddress, NodeId, NodeState, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::balancer::LoadBalancer;
use crate::error::{BalancerError, BalancerResult};

/// A node id, bare or as `{"nodeId": ..}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeArgs {
    Bare(NodeId),
    Named {
        #[serde(rename = "nodeId", alias = "id")]
        node_id: NodeId,
    },
}

impl NodeArgs {
    fn node_id(&self) -> &str {
        match self {
            NodeArgs::Bare(id) | NodeArgs::Named { node_id: id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SetInfoArgs {
    #[serde(rename = "nodeId", alias = "id")]
    node_id: NodeId,
    state: NodeState,
}

/// A room id, bare or as `{"roomId": ..}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoomArgs {
    Bare(RoomId),
    Named {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
}

impl RoomArgs {
    fn room_id(&self) -> &str {
        match self {
            RoomArgs::Bare(id) | RoomArgs::Named { room_id: id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserArgs {
    room_id: RoomId,
    user: String,
}

/// Turn a handler result into reply data.
fn reply<T: Serialize>(result: BalancerResult<T>) -> Value {
    match result.map(|value| serde_json::to_value(value)) {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => error_reply(e.to_string()),
        Err(e) => error_reply(e.to_string()),
    }
}

/// Method table serving `balancer`.
pub fn coordinator_methods(balancer: LoadBalancer) -> MethodTable {
    let mut methods = MethodTable::new();

    let lb = balancer.clone();
    methods.register_typed("registerNode", move |address: NodeAddress| {
        let lb = lb.clone();
        async move { lb.add_node(address).await }
    });

    let lb = balancer.clone();
    methods.register_typed("keepAlive", move |args: NodeArgs| {
        let lb = lb.clone();
        async move { lb.keep_alive(args.node_id()).await }
    });

    let lb = balancer.clone();
    methods.register_typed("setInfo", move |args: SetInfoArgs| {
        let lb = lb.clone();
        async move { reply(lb.set_info(&args.node_id, args.state).await.map(|()| "ok")) }
    });

    let lb = balancer.clone();
    methods.register_typed("assignNodeForRoom", move |args: RoomArgs| {
        let lb = lb.clone();
        async move { lb.assign(args.room_id()).await }
    });

    let lb = balancer.clone();
    methods.register_typed("getUsersInRoom", move |args: RoomArgs| {
        let lb = lb.clone();
        async move { reply(lb.users_in_room(args.room_id()).await) }
    });

    let lb = balancer.clone();
    methods.register_typed("deleteRoom", move |args: RoomArgs| {
        let lb = lb.clone();
        async move { reply(lb.delete_room(args.room_id()).await) }
    });

    let lb = balancer.clone();
    methods.register_typed("deleteUser", move |args: UserArgs| {
        let lb = lb.clone();
        async move { reply(lb.delete_user(&args.room_id, &args.user).await) }
    });

    let lb = balancer.clone();
    methods.register_typed("removeNode", move |args: NodeArgs| {
        let lb = lb.clone();
        async move { json!({ "removed": lb.remove_node(args.node_id()).await }) }
    });

    methods.register("listNodes", move |_args| {
        let lb = balancer.clone();
        async move { reply(Ok::<_, BalancerError>(lb.nodes().await)) }
    });

    methods
}

/// Serve `balancer` on the coordinator queue.
pub async fn serve(endpoint: &RpcEndpoint, balancer: LoadBalancer) -> BalancerResult<()> {
    endpoint.add_methods(coordinator_methods(balancer)).await;
    endpoint.bind(COORDINATOR_QUEUE).await?;
    info!(queue = COORDINATOR_QUEUE, "coordinator service bound");
    Ok(())
}
