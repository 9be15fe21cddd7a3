//! Integration tests for the transport layer
//!
//! These tests run the socket roles against each other over loopback TCP.

#[cfg(test)]
mod tests {
    use crate::transport::{DealerSocket, FrameSink, Multipart, PubSocket, RouterSocket, SubSocket};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_router_dealer_round_trip() {
        let mut router = RouterSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = router.local_addr().to_string();
        let mut dealer = DealerSocket::connect(&addr, b("peer-1")).await.unwrap();

        dealer
            .send_multipart(Multipart::new(vec![], vec![b("ping")]))
            .unwrap();
        let inbound = timeout(WAIT, router.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.idents(), &[b("peer-1")]);
        assert_eq!(inbound.body(), &[b("ping")]);

        router
            .handle()
            .send_multipart(Multipart::new(vec![b("peer-1"), b("extra")], vec![b("pong")]))
            .unwrap();
        let reply = timeout(WAIT, dealer.recv()).await.unwrap().unwrap();
        assert_eq!(reply.idents(), &[b("extra")]);
        assert_eq!(reply.body(), &[b("pong")]);
    }

    #[tokio::test]
    async fn test_router_drops_unknown_identity() {
        let router = RouterSocket::bind("127.0.0.1:0").await.unwrap();
        let result = router
            .handle()
            .send_multipart(Multipart::new(vec![b("nobody")], vec![b("x")]));
        assert!(result.is_ok());

        let no_dest = router.handle().send_multipart(Multipart::new(vec![], vec![b("x")]));
        assert!(no_dest.is_err());
    }

    #[tokio::test]
    async fn test_router_rejects_duplicate_identity() {
        let mut router = RouterSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = router.local_addr().to_string();

        let mut first = DealerSocket::connect(&addr, b("same")).await.unwrap();
        first
            .send_multipart(Multipart::new(vec![], vec![b("hello")]))
            .unwrap();
        timeout(WAIT, router.recv()).await.unwrap().unwrap();

        let mut second = DealerSocket::connect(&addr, b("same")).await.unwrap();
        // The router closes the duplicate connection.
        assert!(timeout(WAIT, second.recv()).await.unwrap().is_none());

        router
            .handle()
            .send_multipart(Multipart::new(vec![b("same")], vec![b("still-first")]))
            .unwrap();
        let reply = timeout(WAIT, first.recv()).await.unwrap().unwrap();
        assert_eq!(reply.body(), &[b("still-first")]);
    }

    #[tokio::test]
    async fn test_pub_fans_out_to_every_subscriber() {
        let publisher = PubSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = publisher.local_addr().to_string();

        let mut sub_a = SubSocket::connect(&addr, b("a")).await.unwrap();
        let mut sub_b = SubSocket::connect(&addr, b("b")).await.unwrap();

        timeout(WAIT, async {
            while publisher.subscriber_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        publisher
            .send_multipart(Multipart::new(vec![], vec![b("tick")]))
            .unwrap();

        for sub in [&mut sub_a, &mut sub_b] {
            let msg = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
            assert_eq!(msg.body(), &[b("tick")]);
        }
    }

    #[tokio::test]
    async fn test_pub_drops_closed_subscribers() {
        let publisher = PubSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = publisher.local_addr().to_string();

        let sub = SubSocket::connect(&addr, b("gone")).await.unwrap();
        timeout(WAIT, async {
            while publisher.subscriber_count() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(sub);

        // Writes fail once the peer is gone; the subscriber is pruned after that.
        timeout(WAIT, async {
            while publisher.subscriber_count() > 0 {
                let _ = publisher.send_multipart(Multipart::new(vec![], vec![b("x")]));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }
}
