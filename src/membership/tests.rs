//! Membership Module Tests
//!
//! ## Test Scopes
//! - **Data Structures**: Identity uniqueness, locations and wire serialization.
//! - **Service Logic**: Join/leave handling and the events handed to the scheduler.
//! - **Failure Detection**: Alive -> Suspect -> Dead driven by silence.

#[cfg(test)]
mod tests {
    use crate::membership::service::MembershipService;
    use crate::membership::types::{
        Location, Member, MemberState, MembershipEvent, MembershipMessage, NodeId,
    };
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    fn member(id: &str, location: Location) -> Member {
        Member {
            id: NodeId(id.to_string()),
            gossip_addr: "127.0.0.1:7000".parse().unwrap(),
            data_addr: "127.0.0.1:8000".parse().unwrap(),
            location,
            state: MemberState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        }
    }

    async fn service() -> (
        std::sync::Arc<MembershipService>,
        tokio::sync::mpsc::UnboundedReceiver<MembershipEvent>,
    ) {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let data: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        MembershipService::new(NodeId::new(), bind, data, Location::new(&["lab"], "local"), vec![])
            .await
            .expect("Failed to create service")
    }

    // ============================================================
    // IDENTITY & LOCATION TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_same_cluster_detection() {
        let a = Location::from_path("eu/rack-1", "a");
        let b = Location::new(&["eu", "rack-1"], "b");
        let c = Location::from_path("eu/rack-2", "c");

        assert!(a.same_cluster(&b));
        assert!(!a.same_cluster(&c));
        assert_eq!(a.common_depth(&c), 1);
    }

    #[test]
    fn test_distance_rank_prefers_closer_nodes() {
        let me = Location::from_path("eu/rack-1", "me");
        let neighbour = Location::from_path("eu/rack-1", "n");
        let far = Location::from_path("us/rack-9", "f");

        assert!(me.distance_rank(&neighbour) < me.distance_rank(&far));
        assert_eq!(me.distance_rank(&far), me.distance_rank(&far));
    }

    #[test]
    fn test_member_bincode_serialization() {
        let original = member("bincode-test", Location::from_path("eu", "h"));

        let encoded = bincode::serialize(&original).expect("bincode serialize failed");
        let restored: Member = bincode::deserialize(&encoded).expect("bincode deserialize failed");

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.location, original.location);
        assert_eq!(restored.data_addr, original.data_addr);
        // last_seen is skipped in serde, should be None
        assert!(restored.last_seen.is_none());
    }

    // ============================================================
    // SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_service_starts_with_itself() {
        let (service, _events) = service().await;

        assert_eq!(service.members.len(), 1);
        let alive = service.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, *service.local_id());
    }

    #[tokio::test]
    async fn test_join_emits_joined_event_once() {
        let (service, mut events) = service().await;
        let joining = member("joiner", Location::from_path("lab", "j"));
        let src: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        service
            .handle_message(MembershipMessage::Join { member: joining.clone() }, src)
            .await
            .unwrap();
        service
            .handle_message(MembershipMessage::Join { member: joining.clone() }, src)
            .await
            .unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            MembershipEvent::Joined(joining.id.clone(), joining.location.clone())
        );
        assert!(events.try_recv().is_err());
        assert_eq!(service.data_addr(&joining.id), Some(joining.data_addr));
    }

    #[tokio::test]
    async fn test_leave_emits_left_and_hides_address() {
        let (service, mut events) = service().await;
        let joining = member("leaver", Location::default());
        let src: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        service
            .handle_message(MembershipMessage::Join { member: joining.clone() }, src)
            .await
            .unwrap();
        let _ = events.try_recv();

        service
            .handle_message(MembershipMessage::Leave { node_id: joining.id.clone() }, src)
            .await
            .unwrap();

        assert_eq!(events.try_recv().unwrap(), MembershipEvent::Left(joining.id.clone()));
        assert!(service.data_addr(&joining.id).is_none());
    }

    #[tokio::test]
    async fn test_silent_member_is_suspected_then_declared_dead() {
        let (service, mut events) = service().await;
        let mut silent = member("silent", Location::default());
        silent.last_seen = Some(Instant::now());
        let id = silent.id.clone();
        service.members.insert(id.clone(), silent);

        let start = Instant::now();
        let suspicions = service.detect_failures(start + Duration::from_secs(6));
        assert_eq!(suspicions.len(), 1);
        assert_eq!(service.get_member(&id).unwrap().state, MemberState::Suspect);
        assert!(events.try_recv().is_err());

        service.detect_failures(start + Duration::from_secs(11));
        assert_eq!(service.get_member(&id).unwrap().state, MemberState::Dead);
        assert_eq!(events.try_recv().unwrap(), MembershipEvent::Died(id));
    }
}
