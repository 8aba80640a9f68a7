//! Compute pipeline
//!
//! Responder side: resolve the payment transaction through the chain
//! index, enforce the minimum fee, then hand the job to the sandbox.
//! Client side: pick a provider (explicit target or DHT discovery) and
//! ship the job over the Compute protocol.

use libp2p::PeerId;
use thiserror::Error;
use tracing::{info, warn};

use super::PipelineError;
use crate::chain::Blockchain;
use crate::network::protocol::{ComputeRequest, ComputeResponse, FREE_PASS_TX_ID, MIN_COMPUTE_FEE};
use crate::network::{Client, COMPUTE_CAPABILITY};
use crate::vm::JobRunner;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("payment transaction {0} not found")]
    TxNotFound(String),
    #[error("insufficient payment: got {got}, need {need}")]
    BelowFee { got: u64, need: u64 },
}

/// Check that `tx_id` names a confirmed transaction worth at least the
/// compute fee. The `FREE_PASS` sentinel bypasses the check (testing).
pub fn verify_payment(chain: &Blockchain, tx_id: &str) -> Result<(), PaymentError> {
    if tx_id == FREE_PASS_TX_ID {
        info!("payment verification bypassed (FREE_PASS)");
        return Ok(());
    }

    let tx = chain
        .find_transaction(tx_id)
        .map_err(|_| PaymentError::TxNotFound(tx_id.to_string()))?;

    if tx.amount < MIN_COMPUTE_FEE {
        return Err(PaymentError::BelowFee {
            got: tx.amount,
            need: MIN_COMPUTE_FEE,
        });
    }

    info!(tx_id, amount = tx.amount, "payment verified");
    Ok(())
}

/// Responder side of the compute protocol. The payment gate runs before
/// anything touches the sandbox; a rejected job is never executed.
/// Execution failures complete the exchange with an "ERROR: " payload.
pub fn execute_job(
    chain: Option<&Blockchain>,
    runner: &dyn JobRunner,
    request: &ComputeRequest,
) -> ComputeResponse {
    if let Some(chain) = chain {
        if let Err(e) = verify_payment(chain, &request.tx_id) {
            warn!(tx_id = %request.tx_id, "compute job rejected: {e}");
            return ComputeResponse::Rejected(e.to_string());
        }
    }

    match runner.run(&request.wasm, &request.input) {
        Ok(output) => ComputeResponse::Completed(output),
        Err(e) => {
            warn!("job execution failed: {e}");
            ComputeResponse::Completed(format!("ERROR: {e}").into_bytes())
        }
    }
}

/// Client side: submit a job to `target`, or to the first discovered
/// compute provider that is not ourselves. No retries; callers re-submit.
pub async fn run_job(
    client: &Client,
    target: Option<PeerId>,
    tx_id: &str,
    wasm: Vec<u8>,
    input: Vec<u8>,
) -> Result<Vec<u8>, PipelineError> {
    let peer = match target {
        Some(peer) => peer,
        None => {
            let providers = client.find_providers(COMPUTE_CAPABILITY).await?;
            providers
                .into_iter()
                .find(|p| *p != client.local_peer_id())
                .ok_or(PipelineError::NoComputeProviders)?
        }
    };

    info!(%peer, "submitting compute job");
    Ok(client
        .compute(peer, tx_id.to_string(), wasm, input)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, Transaction, DEFAULT_DIFFICULTY};
    use crate::crypto::wallet::Wallet;
    use crate::shutdown::Shutdown;
    use crate::vm::VmError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Test double that records whether the sandbox was ever invoked.
    struct RecordingRunner {
        calls: AtomicUsize,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl JobRunner for RecordingRunner {
        fn run(&self, _wasm: &[u8], input: &[u8]) -> Result<Vec<u8>, VmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(input.to_vec())
        }
    }

    struct FailingRunner;

    impl JobRunner for FailingRunner {
        fn run(&self, _wasm: &[u8], _input: &[u8]) -> Result<Vec<u8>, VmError> {
            Err(VmError::Compile("bad module".to_string()))
        }
    }

    fn funded_chain(dir: &std::path::Path) -> (Blockchain, String) {
        let miner = Wallet::generate();
        let payee = Wallet::generate();
        let chain =
            Blockchain::open(dir.join("chain"), &miner.address(), DEFAULT_DIFFICULTY).unwrap();

        let tx = Transaction::new_signed(&miner, &payee.address(), 5);
        let tx_id = tx.id.clone();
        chain.add_transaction(tx).unwrap();
        chain.add_block(vec![], &Shutdown::new()).unwrap();
        (chain, tx_id)
    }

    fn request(tx_id: &str) -> ComputeRequest {
        ComputeRequest {
            tx_id: tx_id.to_string(),
            wasm: vec![0x00, 0x61, 0x73, 0x6d],
            input: b"hi".to_vec(),
        }
    }

    #[test]
    fn test_paid_job_executes() {
        let dir = tempdir().unwrap();
        let (chain, tx_id) = funded_chain(dir.path());
        let runner = RecordingRunner::new();

        let response = execute_job(Some(&chain), &runner, &request(&tx_id));
        assert_eq!(response, ComputeResponse::Completed(b"hi".to_vec()));
        assert_eq!(runner.calls(), 1);
    }

    #[test]
    fn test_unknown_payment_never_executes() {
        let dir = tempdir().unwrap();
        let (chain, _) = funded_chain(dir.path());
        let runner = RecordingRunner::new();

        let response = execute_job(Some(&chain), &runner, &request("unknown-tx"));
        assert!(matches!(response, ComputeResponse::Rejected(_)));
        assert_eq!(runner.calls(), 0);
    }

    #[test]
    fn test_underpaid_job_never_executes() {
        let dir = tempdir().unwrap();
        let miner = Wallet::generate();
        let payee = Wallet::generate();
        let chain =
            Blockchain::open(dir.path().join("chain"), &miner.address(), DEFAULT_DIFFICULTY)
                .unwrap();

        let tx = Transaction::new_signed(&miner, &payee.address(), MIN_COMPUTE_FEE - 1);
        let tx_id = tx.id.clone();
        chain.add_transaction(tx).unwrap();
        chain.add_block(vec![], &Shutdown::new()).unwrap();

        let runner = RecordingRunner::new();
        let response = execute_job(Some(&chain), &runner, &request(&tx_id));
        assert!(matches!(response, ComputeResponse::Rejected(_)));
        assert_eq!(runner.calls(), 0);

        let err = verify_payment(&chain, &tx_id).unwrap_err();
        assert!(matches!(err, PaymentError::BelowFee { got: 4, need: 5 }));
    }

    #[test]
    fn test_free_pass_bypasses_payment() {
        let dir = tempdir().unwrap();
        let (chain, _) = funded_chain(dir.path());
        let runner = RecordingRunner::new();

        let response = execute_job(Some(&chain), &runner, &request(FREE_PASS_TX_ID));
        assert_eq!(response, ComputeResponse::Completed(b"hi".to_vec()));
        assert_eq!(runner.calls(), 1);
    }

    #[test]
    fn test_execution_failure_is_error_payload() {
        let dir = tempdir().unwrap();
        let (chain, tx_id) = funded_chain(dir.path());

        let response = execute_job(Some(&chain), &FailingRunner, &request(&tx_id));
        match response {
            ComputeResponse::Completed(payload) => {
                assert!(payload.starts_with(b"ERROR: "));
            }
            other => panic!("expected completed error payload, got {other:?}"),
        }
    }

    #[test]
    fn test_chainless_node_skips_payment_gate() {
        let runner = RecordingRunner::new();
        let response = execute_job(None, &runner, &request("anything"));
        assert_eq!(response, ComputeResponse::Completed(b"hi".to_vec()));
        assert_eq!(runner.calls(), 1);
    }

    #[test]
    fn test_payment_not_found_maps_chain_error() {
        let dir = tempdir().unwrap();
        let (chain, _) = funded_chain(dir.path());

        assert!(matches!(
            chain.find_transaction("missing"),
            Err(ChainError::TxNotFound(_))
        ));
        let err = verify_payment(&chain, "missing").unwrap_err();
        assert!(matches!(err, PaymentError::TxNotFound(_)));
    }
}
