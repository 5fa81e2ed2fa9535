//! Fair-Ring process: joins the ring, asks the operator whether this node
//! requests the critical section, and (on the bootstrap) seeds the token.

use std::collections::HashSet;
use std::sync::Arc;

use lamport_mutex_lab::ring::{self, Message, Node};
use lamport_mutex_lab::wire::{self, Ack};
use lamport_mutex_lab::{cli, membership};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = membership::default_path();
    let mut roster = membership::load(&path).await;
    let id = roster.len() as u32;
    let own_addr = membership::Membership::addr_for_new_id(id);

    let successor = ring::join(&roster, id, own_addr).await?;
    let node = Arc::new(Node::new(id, successor));

    roster.insert(id, own_addr);
    membership::store(&path, &roster).await?;

    let listener = TcpListener::bind(own_addr).await?;
    info!(node = id, %own_addr, "listening");
    {
        let node = node.clone();
        tokio::spawn(async move { accept_loop(node, listener).await });
    }

    let opted_in = cli::prompt_yes_no("do you want to request the critical section").await?;
    node.set_opted_in(opted_in).await;

    if id == 0 {
        cli::prompt_yes_no("begin").await?;

        // Every node's lazy decision resolves to either "will request" or
        // "will not request" the first time the token reaches it, and either
        // way it posts NOTIFY-FINISHED exactly once (on CS completion, or
        // immediately once it decides not to request — ring.rs's
        // `decided_non_requester` path). So membership size at begin time,
        // not the unknowable count of actual requesters `R`, is what the
        // bootstrap can wait on.
        let current_roster = membership::load(&path).await;
        let expected: HashSet<u32> = (0..current_roster.len() as u32).collect();

        node.start_token();
        info!(node = id, n = expected.len(), "token started, waiting for the experiment to settle");
        node.wait_for_completion(&expected).await;
        info!(node = id, "all nodes have resolved their participation");
    }

    cli::wait_for_shutdown(id, &path).await?;
    Ok(())
}

async fn accept_loop(node: Arc<Node>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%err, "accept failed");
                continue;
            }
        };
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(&node, stream).await {
                warn!(%peer, %err, "error occurred while handling a connection");
            }
        });
    }
}

async fn handle_connection(node: &Arc<Node>, mut stream: TcpStream) -> anyhow::Result<()> {
    let message: Message = wire::read_frame(&mut stream).await?;
    match message {
        Message::Token { .. } => {
            let ack = node.on_receive_token(message).await?;
            wire::write_frame(&mut stream, &ack).await?;
        }
        Message::SetSuccessor { addr, .. } => {
            node.handle_set_successor(addr).await;
            wire::write_frame(&mut stream, &Ack).await?;
        }
        Message::SetRequesting { num_requests } => {
            node.handle_set_requesting(num_requests).await;
            wire::write_frame(&mut stream, &Ack).await?;
        }
        Message::NotifyFinished { id } => {
            node.handle_notify_finished(id).await;
            wire::write_frame(&mut stream, &Ack).await?;
        }
    }
    Ok(())
}
