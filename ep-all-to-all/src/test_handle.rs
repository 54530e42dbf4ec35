use std::sync::Arc;

use crate::{
    error::EpError,
    handle::{CommHandle, IntranodeHandle, LowLatencyHandle},
    placement::ExpertPlacement,
    tensor::Matrix,
    topology::TransportMode,
};

fn intranode_handle() -> CommHandle {
    // Two ranks, three tokens; rank 0 sends tokens 0 and 2 to rank 1.
    let mut is_token_in_rank = Matrix::filled(3, 2, false);
    is_token_in_rank.set(0, 1, true);
    is_token_in_rank.set(2, 1, true);
    let mut send_head = Matrix::filled(3, 2, -1i64);
    send_head.set(0, 1, 0);
    send_head.set(2, 1, 1);
    CommHandle::Intranode(Arc::new(IntranodeHandle {
        num_ranks: 2,
        num_tokens: 3,
        num_recv_tokens: 0,
        rank_prefix_matrix: Matrix::from_vec(2, 2, vec![0, 2, 0, 3]).unwrap(),
        channel_prefix_matrix: Matrix::from_vec(2, 1, vec![0, 2]).unwrap(),
        recv_channel_prefix_matrix: Matrix::zeros(2, 1),
        recv_src_idx: Vec::new(),
        is_token_in_rank,
        send_head,
    }))
}

fn low_latency_handle() -> CommHandle {
    let mut layout_range = Matrix::zeros(2, 2);
    layout_range.set(0, 0, LowLatencyHandle::pack_range(0, 3));
    layout_range.set(0, 1, LowLatencyHandle::pack_range(3, 1));
    layout_range.set(1, 1, LowLatencyHandle::pack_range(0, 2));
    CommHandle::LowLatency(Arc::new(LowLatencyHandle {
        num_ranks: 2,
        packed_recv_src_info: Matrix::filled(2, 8, 0),
        packed_recv_layout_range: layout_range,
        num_max_dispatch_tokens_per_rank: 4,
        hidden: 16,
        num_experts: 4,
        placement: ExpertPlacement::linear(4, 2).unwrap(),
    }))
}

#[test]
fn test_accessors() {
    let handle = intranode_handle();
    assert_eq!(handle.mode(), TransportMode::Intranode);
    assert_eq!(handle.num_ranks(), 2);
    assert_eq!(handle.num_tokens(), Some(3));

    let CommHandle::Intranode(inner) = &handle else { unreachable!() };
    assert_eq!(inner.count(0, 1), 2);
    assert_eq!(inner.count(1, 1), 1);
    assert_eq!(inner.recv_offset(1, 1), 2);
    assert_eq!(inner.num_sent(0), 2);

    let handle = low_latency_handle();
    assert_eq!(handle.num_tokens(), None);
    assert_eq!(handle.num_recv_tokens(), 6);
}

#[test]
fn test_range_packing() {
    let range = LowLatencyHandle::pack_range(1 << 20, 7);
    assert_eq!(LowLatencyHandle::unpack_range(range), (1 << 20, 7));
    assert_eq!(LowLatencyHandle::unpack_range(0), (0, 0));
}

#[test]
fn test_bytes_round_trip() {
    for handle in [intranode_handle(), low_latency_handle()] {
        let bytes = handle.to_bytes().unwrap();
        assert_eq!(CommHandle::from_bytes(&bytes).unwrap(), handle);
    }
}

#[test]
fn test_garbage_bytes() {
    let err = CommHandle::from_bytes(&[0xff; 3]).unwrap_err();
    assert!(matches!(err, EpError::Serialization(_)), "{err}");
}

#[test]
fn test_compatibility() {
    let handle = intranode_handle();
    handle.check_compatible(TransportMode::Intranode, 2).unwrap();
    let err = handle.check_compatible(TransportMode::Internode, 2).unwrap_err();
    assert!(matches!(err, EpError::Usage(_)));
    let err = handle.check_compatible(TransportMode::Intranode, 4).unwrap_err();
    assert!(matches!(err, EpError::Usage(_)));
    let err =
        low_latency_handle().check_compatible(TransportMode::Intranode, 2).unwrap_err();
    assert!(matches!(err, EpError::Usage(_)));
}
