//! Integration tests for the in-memory broker.
//!
//! These drive the broker purely through the transport traits, the same
//! way the pub/sub layer does.

#[cfg(feature = "memory")]
mod memory {
    use std::time::Duration;

    use warren_transport::{
        Channel, Connection, ConsumeOptions, Consumer, Delivery, ExchangeKind,
        MemoryBroker, MemoryConsumer, MemoryDelivery, QueueOptions, TransportError,
    };

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_exchange("peril_direct", ExchangeKind::Direct);
        broker.declare_exchange("peril_topic", ExchangeKind::Topic);
        broker.declare_exchange("peril_dlx", ExchangeKind::Fanout);
        broker
    }

    fn durable() -> QueueOptions {
        QueueOptions {
            durable: true,
            ..Default::default()
        }
    }

    async fn next(consumer: &mut MemoryConsumer) -> MemoryDelivery {
        tokio::time::timeout(Duration::from_secs(1), consumer.next_delivery())
            .await
            .expect("delivery should arrive")
            .expect("consumer should be open")
            .expect("delivery should be ok")
    }

    async fn nothing_pending(consumer: &mut MemoryConsumer) -> bool {
        tokio::time::timeout(Duration::from_millis(50), consumer.next_delivery())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_publish_reaches_bound_queue() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");

        ch.declare_queue("pause", &durable()).await.expect("declare");
        ch.bind_queue("pause", "pause", "peril_direct")
            .await
            .expect("bind");
        ch.publish("peril_direct", "pause", "application/json", b"{}")
            .await
            .expect("publish");

        assert_eq!(broker.queue_depth("pause"), Some(1));

        let mut consumer = ch
            .consume("pause", &ConsumeOptions::default())
            .await
            .expect("consume");
        let delivery = next(&mut consumer).await;
        assert_eq!(delivery.body(), b"{}");
        assert_eq!(delivery.content_type(), Some("application/json"));
        assert_eq!(delivery.routing_key(), "pause");
        assert!(!delivery.redelivered());
        delivery.ack().await.expect("ack");

        assert_eq!(broker.queue_depth("pause"), Some(0));
        assert_eq!(broker.unacked_count("pause"), 0);
    }

    #[tokio::test]
    async fn test_unrouted_message_is_dropped() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("pause", &durable()).await.expect("declare");

        ch.publish("peril_direct", "nobody", "application/json", b"{}")
            .await
            .expect("publishing without a match is not an error");
        assert_eq!(broker.queue_depth("pause"), Some(0));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_is_not_found() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");

        let err = ch
            .publish("missing", "key", "application/json", b"{}")
            .await
            .expect_err("should fail");
        assert!(matches!(err, TransportError::NotFound(_)));
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_topic_routing_with_wildcards() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");

        ch.declare_queue("moves", &durable()).await.expect("declare");
        ch.bind_queue("moves", "army_moves.*", "peril_topic")
            .await
            .expect("bind");

        for key in ["army_moves.alice", "army_moves", "war.alice"] {
            ch.publish("peril_topic", key, "application/json", b"{}")
                .await
                .expect("publish");
        }
        assert_eq!(broker.queue_depth("moves"), Some(1));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_options_fails() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");

        ch.declare_queue("logs", &durable()).await.expect("declare");
        let info = ch
            .declare_queue("logs", &durable())
            .await
            .expect("identical redeclare is fine");
        assert_eq!(info.name, "logs");

        let err = ch
            .declare_queue("logs", &QueueOptions::default())
            .await
            .expect_err("mismatch should fail");
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_exclusive_queue_is_locked_to_owner() {
        let broker = broker();
        let owner = broker.connect();
        let other = broker.connect();
        let options = QueueOptions {
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        };

        let ch = owner.open_channel().await.expect("channel");
        ch.declare_queue("pause.alice", &options).await.expect("declare");

        let ch2 = other.open_channel().await.expect("channel");
        let err = ch2
            .declare_queue("pause.alice", &options)
            .await
            .expect_err("other connection should be refused");
        assert!(matches!(err, TransportError::ResourceLocked(_)));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_bind_to_unknown_exchange_is_not_found() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("q", &durable()).await.expect("declare");

        let err = ch
            .bind_queue("q", "key", "nope")
            .await
            .expect_err("should fail");
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("q", &durable()).await.expect("declare");
        ch.bind_queue("q", "k", "peril_direct").await.expect("bind");
        for _ in 0..3 {
            ch.publish("peril_direct", "k", "", b"m").await.expect("publish");
        }

        ch.set_prefetch(2).await.expect("qos");
        let mut consumer = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect("consume");

        let first = next(&mut consumer).await;
        let _second = next(&mut consumer).await;
        assert!(nothing_pending(&mut consumer).await);
        assert_eq!(broker.unacked_count("q"), 2);

        first.ack().await.expect("ack");
        let _third = next(&mut consumer).await;
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_first() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("q", &durable()).await.expect("declare");
        ch.bind_queue("q", "k", "peril_direct").await.expect("bind");
        ch.publish("peril_direct", "k", "", b"one").await.expect("publish");
        ch.publish("peril_direct", "k", "", b"two").await.expect("publish");

        ch.set_prefetch(1).await.expect("qos");
        let mut consumer = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect("consume");

        let first = next(&mut consumer).await;
        assert_eq!(first.body(), b"one");
        first.nack(true).await.expect("nack");

        let again = next(&mut consumer).await;
        assert_eq!(again.body(), b"one");
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn test_nack_discard_goes_to_dead_letter_exchange() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");

        ch.declare_queue("peril_dlq", &durable()).await.expect("declare");
        ch.bind_queue("peril_dlq", "", "peril_dlx").await.expect("bind");

        let options = QueueOptions {
            durable: true,
            dead_letter_exchange: Some("peril_dlx".into()),
            ..Default::default()
        };
        ch.declare_queue("q", &options).await.expect("declare");
        ch.bind_queue("q", "k", "peril_direct").await.expect("bind");
        ch.publish("peril_direct", "k", "", b"bad").await.expect("publish");

        let mut consumer = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect("consume");
        next(&mut consumer).await.nack(false).await.expect("nack");

        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.queue_depth("peril_dlq"), Some(1));
    }

    #[tokio::test]
    async fn test_nack_discard_without_dead_letter_exchange_drops() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("q", &durable()).await.expect("declare");
        ch.bind_queue("q", "k", "peril_direct").await.expect("bind");
        ch.publish("peril_direct", "k", "", b"bad").await.expect("publish");

        let mut consumer = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect("consume");
        next(&mut consumer).await.nack(false).await.expect("nack");

        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("q", &durable()).await.expect("declare");
        ch.bind_queue("q", "k", "peril_direct").await.expect("bind");

        let mut a = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect("consume");
        let mut b = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect("consume");
        assert_ne!(a.tag(), b.tag());

        for body in [b"1", b"2"] {
            ch.publish("peril_direct", "k", "", body).await.expect("publish");
        }
        assert_eq!(next(&mut a).await.body(), b"1");
        assert_eq!(next(&mut b).await.body(), b"2");
    }

    #[tokio::test]
    async fn test_channel_close_requeues_unacked_and_ends_stream() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("q", &durable()).await.expect("declare");
        ch.bind_queue("q", "k", "peril_direct").await.expect("bind");
        ch.publish("peril_direct", "k", "", b"m").await.expect("publish");

        let mut consumer = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect("consume");
        let delivery = next(&mut consumer).await;

        ch.close().await.expect("close");
        assert!(consumer.next_delivery().await.is_none());
        assert_eq!(broker.queue_depth("q"), Some(1));

        let err = delivery.ack().await.expect_err("channel is gone");
        assert!(err.is_closed());

        let err = ch
            .publish("peril_direct", "k", "", b"m")
            .await
            .expect_err("closed channel");
        assert!(matches!(err, TransportError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn test_auto_delete_queue_removed_with_last_consumer() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        let options = QueueOptions {
            auto_delete: true,
            ..Default::default()
        };
        ch.declare_queue("temp", &options).await.expect("declare");
        ch.bind_queue("temp", "k", "peril_direct").await.expect("bind");
        let _consumer = ch
            .consume("temp", &ConsumeOptions::default())
            .await
            .expect("consume");

        assert!(broker.has_queue("temp"));
        ch.close().await.expect("close");
        assert!(!broker.has_queue("temp"));
        assert!(broker.queue_bindings("temp").is_empty());
    }

    #[tokio::test]
    async fn test_connection_close_deletes_exclusive_queues() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        let options = QueueOptions {
            exclusive: true,
            ..Default::default()
        };
        ch.declare_queue("mine", &options).await.expect("declare");

        conn.close().await.expect("close");
        assert!(!conn.is_open());
        assert!(!broker.has_queue("mine"));

        let err = conn.open_channel().await.expect_err("closed connection");
        assert!(matches!(err, TransportError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_exclusive_consumer_blocks_others() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("q", &durable()).await.expect("declare");

        let exclusive = ConsumeOptions {
            exclusive: true,
            ..Default::default()
        };
        let _only = ch.consume("q", &exclusive).await.expect("consume");
        let err = ch
            .consume("q", &ConsumeOptions::default())
            .await
            .expect_err("queue in exclusive use");
        assert!(matches!(err, TransportError::ResourceLocked(_)));
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = broker();
        let conn = broker.connect();
        let ch = conn.open_channel().await.expect("channel");
        ch.declare_queue("direct_q", &durable()).await.expect("declare");

        ch.publish("", "direct_q", "", b"m").await.expect("publish");
        assert_eq!(broker.queue_depth("direct_q"), Some(1));
    }
}
