//! Transport scenarios over real loopback sockets

use super::loopback::async_id_for;
use super::{init_tracing, FakeServer, ServerOptions};
use crate::config::TransportConfig;
use crate::error::{Error, NtStatus};
use crate::message::{Chain, Message, RequestParams};
use crate::protocol::{Smb2Command, Smb2Request, Smb2Response};
use crate::transport::tcp::TcpBinding;
use crate::transport::{ConnectionState, Transport};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn tcp_transport(config: TransportConfig) -> Arc<Transport<TcpBinding>> {
    init_tracing();
    Arc::new(Transport::new(TcpBinding::new(config.clone()), config))
}

async fn echo(transport: &Transport<TcpBinding>, text: &'static str) -> crate::Result<Smb2Response> {
    transport
        .send(
            Smb2Request::new(Smb2Command::Echo, text.as_bytes()),
            Smb2Response::default(),
            RequestParams::default(),
        )
        .await
}

/// First exchange on a fresh connection; opens the credit window the way a
/// negotiate would
async fn open_credit_window(transport: &Transport<TcpBinding>) {
    echo(transport, "negotiate").await.unwrap();
    assert!(transport.binding().available_credits() > 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_echo() {
        let server = FakeServer::start().await.unwrap();
        let transport = tcp_transport(server.config());

        let start = Instant::now();
        assert!(transport.ensure_connected().await.unwrap());
        assert!(start.elapsed() < transport.config().connect_timeout);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(transport.binding().remote_addr().unwrap(), server.addr());

        let response = echo(&transport, "hello").await.unwrap();
        assert_eq!(&response.body[..], b"hello");
        assert_eq!(response.status(), Some(NtStatus::Success));
        assert_eq!(response.header.credit, transport.config().desired_credits);
        assert_eq!(
            transport.binding().available_credits(),
            usize::from(transport.config().desired_credits)
        );
        assert_eq!(transport.pending(), 0);

        transport.disconnect(false, true).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_request_timeout_then_success() {
        let server = FakeServer::start().await.unwrap();
        let config = TransportConfig {
            response_timeout: Duration::from_millis(300),
            ..server.config()
        };
        let transport = tcp_transport(config);
        transport.ensure_connected().await.unwrap();
        open_credit_window(&transport).await;

        let start = Instant::now();
        let err = echo(&transport, "silent").await.unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::RequestTimeout(_)), "{:?}", err);
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
        assert_eq!(transport.state(), ConnectionState::Connected);

        // the server now sends the stale reply first; it must be skipped
        let response = echo(&transport, "after").await.unwrap();
        assert_eq!(&response.body[..], b"after");
        assert_eq!(transport.pending(), 0);
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn test_server_close_fails_every_pending_request() {
        let server = FakeServer::start_with(ServerOptions {
            close_after_held: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();
        let transport = tcp_transport(server.config());
        transport.ensure_connected().await.unwrap();
        open_credit_window(&transport).await;

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let transport = transport.clone();
                tokio::spawn(async move {
                    transport
                        .send(
                            Smb2Request::new(Smb2Command::Read, &b"hold"[..]),
                            Smb2Response::default(),
                            RequestParams::NO_TIMEOUT,
                        )
                        .await
                })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Transport { .. }), "{:?}", err);
        }
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(transport.pending(), 0);
    }

    #[tokio::test]
    async fn test_compound_exchange() {
        let server = FakeServer::start().await.unwrap();
        let transport = tcp_transport(server.config());
        transport.ensure_connected().await.unwrap();
        open_credit_window(&transport).await;

        let mut chain = Chain::new(
            Smb2Request::new(Smb2Command::Create, &b"create"[..]),
            Smb2Response::default(),
        )
        .then(
            Smb2Request::new(Smb2Command::QueryInfo, &b"query"[..]).related(),
            Smb2Response::default(),
        )
        .then(
            Smb2Request::new(Smb2Command::Close, &b"close"[..]).related(),
            Smb2Response::default(),
        );
        transport
            .sendrecv(&mut chain, RequestParams::default())
            .await
            .unwrap();

        let expected = [
            (Smb2Command::Create, &b"create"[..]),
            (Smb2Command::QueryInfo, &b"query"[..]),
            (Smb2Command::Close, &b"close"[..]),
        ];
        let mids: Vec<u64> = chain.requests().iter().map(|request| request.mid()).collect();
        for ((reply, (command, body)), mid) in chain.replies().iter().zip(expected).zip(mids) {
            assert_eq!(reply.mid(), mid);
            reply.with_body(|response| {
                assert_eq!(response.header.command, command);
                assert_eq!(response.header.message_id, mid);
                assert!(response.body.starts_with(body));
            });
        }
    }

    #[tokio::test]
    async fn test_status_pending_keeps_caller_waiting() {
        let server = FakeServer::start_with(ServerOptions {
            pending_delay: Duration::from_millis(200),
            ..Default::default()
        })
        .await
        .unwrap();
        let transport = tcp_transport(server.config());
        transport.ensure_connected().await.unwrap();

        let mut chain = Chain::new(
            Smb2Request::new(Smb2Command::ChangeNotify, &b"watch"[..]),
            Smb2Response::default(),
        );
        transport
            .sendrecv(&mut chain, RequestParams::default())
            .await
            .unwrap();

        let request = chain.head();
        assert_eq!(
            request.header.async_id,
            async_id_for(request.mid())
        );
        chain.replies()[0].with_body(|response| {
            assert_eq!(response.status(), Some(NtStatus::Success));
            assert!(response.is_async_handled());
            assert_eq!(&response.body[..], b"watch");
        });
    }

    #[tokio::test]
    async fn test_status_pending_without_deadline_outlives_response_timeout() {
        let server = FakeServer::start_with(ServerOptions {
            pending_delay: Duration::from_millis(600),
            ..Default::default()
        })
        .await
        .unwrap();
        let config = TransportConfig {
            response_timeout: Duration::from_millis(200),
            ..server.config()
        };
        let transport = tcp_transport(config);
        transport.ensure_connected().await.unwrap();

        let start = Instant::now();
        let response = transport
            .send(
                Smb2Request::new(Smb2Command::ChangeNotify, &b"long poll"[..]),
                Smb2Response::default(),
                RequestParams::NO_TIMEOUT,
            )
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert_eq!(&response.body[..], b"long poll");
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_compound_waits_for_credit_window() {
        let server = FakeServer::start().await.unwrap();
        let config = TransportConfig {
            response_timeout: Duration::from_millis(200),
            ..server.config()
        };
        let transport = tcp_transport(config);
        transport.ensure_connected().await.unwrap();
        assert_eq!(transport.binding().available_credits(), 1);

        let compound = || {
            Chain::new(
                Smb2Request::new(Smb2Command::Create, &b"create"[..]),
                Smb2Response::default(),
            )
            .then(
                Smb2Request::new(Smb2Command::Close, &b"close"[..]).related(),
                Smb2Response::default(),
            )
        };

        // two credits needed, one granted so far
        let mut chain = compound();
        let err = transport
            .sendrecv(&mut chain, RequestParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(ref msg) if msg.contains("credits")), "{:?}", err);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(transport.pending(), 0);
        assert_eq!(transport.binding().available_credits(), 1);

        open_credit_window(&transport).await;
        let mut chain = compound();
        transport
            .sendrecv(&mut chain, RequestParams::default())
            .await
            .unwrap();
        assert!(chain.replies().iter().all(|reply| reply.is_received()));
    }

    #[tokio::test]
    async fn test_keepalives_are_dodged() {
        let server = FakeServer::start_with(ServerOptions {
            keepalives: true,
            ..Default::default()
        })
        .await
        .unwrap();
        let transport = tcp_transport(server.config());
        transport.ensure_connected().await.unwrap();

        for text in ["one", "two", "three"] {
            let response = echo(&transport, text).await.unwrap();
            assert_eq!(&response.body[..], text.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_reconnect_uses_a_fresh_connection() {
        let server = FakeServer::start().await.unwrap();
        let transport = tcp_transport(server.config());
        transport.ensure_connected().await.unwrap();
        echo(&transport, "first").await.unwrap();

        transport.disconnect(true, true).await.unwrap();
        assert!(transport.binding().remote_addr().is_err());

        assert!(transport.ensure_connected().await.unwrap());
        let response = echo(&transport, "second").await.unwrap();
        assert_eq!(&response.body[..], b"second");
        // message ids restart with the connection
        assert_eq!(response.header.message_id, 0);
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let addr = {
            let server = FakeServer::start().await.unwrap();
            server.addr()
        };
        // let the aborted listener task release the port
        tokio::time::sleep(Duration::from_millis(50)).await;

        let transport = tcp_transport(TransportConfig::for_addr(addr));
        let err = transport.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "{:?}", err);
        assert_eq!(transport.state(), ConnectionState::Error);
    }
}
