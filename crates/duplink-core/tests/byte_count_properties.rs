//! 属性测试 - 下载完整性只取决于字节计数
//!
//! 对端按任意分块（可以一块都没有）推送数据后发 `completed`: 总数等于预告大小时文件保留，
//! 否则判定失败并删除文件。

mod common;

use std::sync::Arc;

use common::{DuplexConnector, Harness};
use duplink_core::bus::{LocalRequest, SessionEvent};
use duplink_core::workflow::SessionState;
use proptest::prelude::*;
use tokio::io::AsyncWriteExt;

/// 返回 (是否成功, 文件是否还在)
fn run_download(chunks: &[usize], announced: u64) -> (bool, bool) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("p.bin");
        let (connector, mut peers) = DuplexConnector::new();
        let mut h = Harness::new(Arc::new(connector), dir.path());

        h.send(SessionEvent::Request(LocalRequest::Download {
            destination: Some(target.clone()),
        }))
        .await;
        h.peer_says(&format!("fn:p.bin fl:{}", announced)).await;
        h.step().await;
        assert_eq!(h.state(), SessionState::Transferring);

        let mut peer = peers.recv().await.unwrap();
        let total: u64 = chunks.iter().map(|&c| c as u64).sum();
        for &len in chunks {
            peer.write_all(&vec![0x5a; len]).await.unwrap();
        }
        h.step_until(|m| {
            m.session()
                .descriptor()
                .is_some_and(|d| d.transferred == total)
        })
        .await;

        h.peer_says("completed").await;
        assert_eq!(h.state(), SessionState::Idle);

        let succeeded = h.observer.completed().len() == 1;
        (succeeded, target.exists())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_matching_sum_keeps_file(chunks in prop::collection::vec(1usize..3000, 0..8)) {
        let total: u64 = chunks.iter().map(|&c| c as u64).sum();
        let (succeeded, exists) = run_download(&chunks, total);
        prop_assert!(succeeded);
        prop_assert!(exists);
    }

    #[test]
    fn prop_mismatched_sum_deletes_file(
        chunks in prop::collection::vec(1usize..3000, 0..8),
        delta in 1u64..500,
        over in any::<bool>(),
    ) {
        let total: u64 = chunks.iter().map(|&c| c as u64).sum();
        let announced = if over { total + delta } else { total.saturating_sub(delta) };
        prop_assume!(announced != total);

        let (succeeded, exists) = run_download(&chunks, announced);
        prop_assert!(!succeeded);
        prop_assert!(!exists);
    }
}
