//! Property-based round-trip tests for the QLAM/GRAM/RRM wire codecs and
//! the LSA encoded-capacity format, across the full value range rather
//! than the handful of fixed samples the unit tests cover.

use bytes::Bytes;
use proptest::prelude::*;

use gnat_wire::gram::{Gram, GramAction};
use gnat_wire::qlam::{Qlam, QlamDepthPair, QlamGroup};
use gnat_wire::rrm::Rrm;

fn depth_pair_strategy() -> impl Strategy<Value = QlamDepthPair> {
    (any::<u8>(), any::<u32>(), any::<u32>()).prop_map(|(dst_bin_id, queue_depth_bytes, ls_queue_depth_bytes)| {
        QlamDepthPair { dst_bin_id, queue_depth_bytes, ls_queue_depth_bytes }
    })
}

fn group_strategy() -> impl Strategy<Value = QlamGroup> {
    (any::<u32>(), prop::collection::vec(depth_pair_strategy(), 0..6))
        .prop_map(|(group_id, pairs)| QlamGroup { group_id, pairs })
}

proptest! {
    #[test]
    fn qlam_roundtrip(
        src_bin_id in any::<u8>(),
        seq_num in any::<u32>(),
        groups in prop::collection::vec(group_strategy(), 0..4),
    ) {
        let qlam = Qlam { src_bin_id, seq_num, groups };
        let encoded = qlam.encode();
        prop_assert_eq!(encoded.len(), qlam.encoded_len());
        let mut buf = encoded;
        let decoded = Qlam::decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, qlam);
    }

    #[test]
    fn gram_roundtrip(
        src_bin_id in any::<u8>(),
        seq_num in any::<u16>(),
        mcast_addr in any::<u32>(),
        is_join in any::<bool>(),
    ) {
        let gram = Gram {
            src_bin_id,
            seq_num,
            mcast_addr,
            action: if is_join { GramAction::Join } else { GramAction::Leave },
        };
        let mut encoded = gram.encode();
        prop_assert_eq!(encoded.len(), Gram::ENCODED_LEN);
        let decoded = Gram::decode(&mut encoded).unwrap();
        prop_assert_eq!(decoded, gram);
    }

    #[test]
    fn rrm_roundtrip_preserves_counters_and_loss_rate_to_ppm_precision(
        flow_token in any::<u64>(),
        highest_bytes_sourced in any::<u64>(),
        highest_packets_sourced in any::<u64>(),
        total_bytes_released in any::<u64>(),
        packets_released in any::<u64>(),
        avg_loss_rate in 0.0f64..=1.0,
    ) {
        let rrm = Rrm {
            flow_token,
            highest_bytes_sourced,
            highest_packets_sourced,
            total_bytes_released,
            packets_released,
            avg_loss_rate,
        };
        let mut encoded = rrm.encode();
        prop_assert_eq!(encoded.len(), Rrm::ENCODED_LEN);
        let decoded = Rrm::decode(&mut encoded).unwrap();
        prop_assert_eq!(decoded.flow_token, flow_token);
        prop_assert_eq!(decoded.highest_bytes_sourced, highest_bytes_sourced);
        prop_assert_eq!(decoded.highest_packets_sourced, highest_packets_sourced);
        prop_assert_eq!(decoded.total_bytes_released, total_bytes_released);
        prop_assert_eq!(decoded.packets_released, packets_released);
        // one part-per-million, the wire's own quantization step
        prop_assert!((decoded.avg_loss_rate - avg_loss_rate).abs() <= 1.0e-6 + 1e-9);
    }

    #[test]
    fn truncated_qlam_never_panics_only_errors(cut in 0usize..20) {
        let qlam = Qlam {
            src_bin_id: 7,
            seq_num: 42,
            groups: vec![QlamGroup {
                group_id: 1,
                pairs: vec![QlamDepthPair { dst_bin_id: 3, queue_depth_bytes: 100, ls_queue_depth_bytes: 5 }],
            }],
        };
        let encoded = qlam.encode();
        let cut = cut.min(encoded.len());
        let mut truncated: Bytes = encoded.slice(0..encoded.len() - cut);
        let _ = Qlam::decode(&mut truncated);
    }
}
