//! Maekawa-style Voting process: joins the network, and — only on the
//! bootstrap — asks how many nodes will request the critical section and
//! when to begin.

use std::collections::HashSet;
use std::sync::Arc;

use lamport_mutex_lab::voting::{self, Message, Node};
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

    voting::join(&roster, id, own_addr).await;
    let node = Arc::new(Node::new(id, own_addr, roster.clone()));

    roster.insert(id, own_addr);
    membership::store(&path, &roster).await?;

    let listener = TcpListener::bind(own_addr).await?;
    info!(node = id, %own_addr, "listening");
    {
        let node = node.clone();
        tokio::spawn(async move { accept_loop(node, listener).await });
    }

    if id == 0 {
        let num_requests = cli::prompt_count("how many nodes request the critical section").await?;
        for (peer_id, addr) in roster.peers_excluding(id) {
            let message = Message::SetRequesting { num_requests };
            if let Err(err) = wire::call::<_, Ack>(addr, &message).await {
                warn!(node = id, peer = peer_id, %err, "error occurred while setting requesting");
            }
        }
        node.handle_set_requesting(num_requests).await;

        cli::prompt_yes_no("begin").await?;
        for (peer_id, addr) in roster.peers_excluding(id) {
            if let Err(err) = wire::call::<_, Ack>(addr, &Message::StartRequest).await {
                warn!(node = id, peer = peer_id, %err, "error occurred while starting the request process");
            }
        }
        node.begin_request().await;

        let expected: HashSet<u32> = (0..num_requests).collect();
        node.wait_for_completion(&expected).await;
        info!(node = id, "all requesting nodes completed");
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
        Message::Request { .. } => {
            let ack = node.on_receive_request(message).await?;
            wire::write_frame(&mut stream, &ack).await?;
        }
        Message::Vote { .. } => {
            let ack = node.on_receive_vote(message).await?;
            wire::write_frame(&mut stream, &ack).await?;
        }
        Message::Release { .. } => {
            let ack = node.on_receive_release(message).await?;
            wire::write_frame(&mut stream, &ack).await?;
        }
        Message::RescindVote { .. } => {
            let reply = node.on_receive_rescind_vote(message).await?;
            wire::write_frame(&mut stream, &reply).await?;
        }
        Message::AddNode { id, addr } => {
            node.handle_add_node(id, addr).await;
            wire::write_frame(&mut stream, &Ack).await?;
        }
        Message::SetRequesting { num_requests } => {
            node.handle_set_requesting(num_requests).await;
            wire::write_frame(&mut stream, &Ack).await?;
        }
        Message::StartRequest => {
            let node = node.clone();
            tokio::spawn(async move { node.begin_request().await });
            wire::write_frame(&mut stream, &Ack).await?;
        }
        Message::NotifyFinished { id } => {
            node.handle_notify_finished(id).await;
            wire::write_frame(&mut stream, &Ack).await?;
        }
    }
    Ok(())
}
