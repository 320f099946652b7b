//! Block scanner state machine.
//!
//! The scanner walks a height range, fetches each block from a
//! [`LedgerSource`] and turns it into an ordered stream of [`ScanEvent`]s.
//! It knows nothing about which addresses matter; observers decide that.
//!
//! Per block the order is fixed: a `Block` event, then for each transaction
//! in block order one `Spend` per non-coinbase input followed by one
//! `Receive` per output address. Cancellation is checked once per block,
//! after the block has been fully delivered.
//!
//! Two modes share the same machinery:
//! - [`BlockScanner::scan`] runs the range to the end (or a cancellation).
//! - [`BlockScanner::scan_reentrant`] additionally stops when an observer
//!   asks to halt and reports the height to resume from, so the caller can
//!   adjust its watch list and reprocess that height.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::RecoveryError;
use crate::ledger::LedgerSource;
use crate::types::{Block, Inpoint, Outpoint};

/// Lifecycle of a scanner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// Never started
    Pending,
    /// Walking a range
    Scanning,
    /// Stopped early; terminal for the invocation
    Canceled,
    /// Range exhausted; terminal for the invocation
    Complete,
}

impl ScanState {
    /// Apply a transition, rejecting any the state machine does not allow.
    ///
    /// Any state except `Scanning` may start a new invocation; only a running
    /// scan can be canceled or completed.
    pub fn transition(self, to: ScanState) -> Result<ScanState, RecoveryError> {
        use ScanState::*;

        match (self, to) {
            (Pending | Canceled | Complete, Scanning) => Ok(to),
            (Scanning, Canceled | Complete) => Ok(to),
            _ => Err(RecoveryError::InvalidTransition { from: self, to }),
        }
    }
}

/// An observation produced while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent<'a> {
    /// A new invocation began
    Start,
    /// A block was fetched and is about to be delivered
    Block { height: u64, hash: &'a str },
    /// An output paid `address`
    Receive {
        address: &'a str,
        outpoint: Outpoint,
        value: u64,
    },
    /// An input consumed `outpoint`
    Spend { outpoint: Outpoint, inpoint: Inpoint },
    /// The requested range was exhausted
    Complete,
}

/// Observer's answer to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    /// Stop after the current block so it can be reprocessed
    Halt,
}

impl Continuation {
    pub fn from_continue(keep_going: bool) -> Self {
        if keep_going {
            Continuation::Continue
        } else {
            Continuation::Halt
        }
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, Continuation::Halt)
    }

    /// Halt wins over continue.
    pub fn and(self, other: Continuation) -> Continuation {
        if self.is_halt() || other.is_halt() {
            Continuation::Halt
        } else {
            Continuation::Continue
        }
    }
}

/// Consumer of scan events.
pub trait ScanObserver {
    fn on_event(&mut self, event: &ScanEvent<'_>) -> Continuation;
}

impl<F> ScanObserver for F
where
    F: FnMut(&ScanEvent<'_>) -> Continuation,
{
    fn on_event(&mut self, event: &ScanEvent<'_>) -> Continuation {
        self(event)
    }
}

/// Deliver one block's observations to `observer` in scan order.
///
/// Returns `Halt` if the observer asked to halt on any of them. Every
/// observation of the block is delivered regardless.
pub fn observe_block<O: ScanObserver + ?Sized>(block: &Block, observer: &mut O) -> Continuation {
    let mut flow = observer.on_event(&ScanEvent::Block {
        height: block.height,
        hash: &block.hash,
    });

    for tx in &block.transactions {
        // coinbase inputs reference nothing
        if !tx.is_coinbase() {
            for (n, input) in tx.inputs.iter().enumerate() {
                let Some(outpoint) = input.prev_outpoint() else {
                    continue;
                };
                let inpoint = Inpoint::new(tx.txid.clone(), n as u32);
                flow = flow.and(observer.on_event(&ScanEvent::Spend { outpoint, inpoint }));
            }
        }

        for (n, output) in tx.outputs.iter().enumerate() {
            for address in &output.addresses {
                flow = flow.and(observer.on_event(&ScanEvent::Receive {
                    address,
                    outpoint: Outpoint::new(tx.txid.clone(), n as u32),
                    value: output.value,
                }));
            }
        }
    }

    flow
}

/// How a scan invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every height in the range was delivered
    Complete,
    /// An observer halted; `resume_height` is the halted block's height
    Halted { resume_height: u64 },
    /// A cancellation request was honored after the previous block
    Canceled { resume_height: u64 },
}

impl ScanOutcome {
    /// Height to pass as the next start, if the range was not exhausted.
    pub fn resume_height(&self) -> Option<u64> {
        match self {
            ScanOutcome::Complete => None,
            ScanOutcome::Halted { resume_height } | ScanOutcome::Canceled { resume_height } => {
                Some(*resume_height)
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ScanState>,
    cancel_requested: AtomicBool,
}

impl Shared {
    fn state(&self) -> ScanState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, to: ScanState) -> Result<(), RecoveryError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = state.transition(to)?;
        Ok(())
    }
}

/// Cooperative cancellation handle.
///
/// Cloneable and usable from another task while a scan runs. A request is
/// honored at the next block boundary and consumed when honored.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    /// A handle not yet attached to any scan.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ScanState::Pending),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Request a cooperative stop.
    ///
    /// A request made while no scan is running is kept for the next
    /// invocation. Canceling after the range completed is rejected.
    pub fn cancel(&self) -> Result<(), RecoveryError> {
        let state = self.shared.state();
        if state == ScanState::Complete {
            return Err(RecoveryError::InvalidTransition {
                from: state,
                to: ScanState::Canceled,
            });
        }
        self.shared.cancel_requested.store(true, Ordering::SeqCst);
        debug!("Cancellation requested (state {:?})", state);
        Ok(())
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::SeqCst)
    }

    /// State of the scan this handle is attached to.
    pub fn state(&self) -> ScanState {
        self.shared.state()
    }

    /// Consume a pending request.
    pub(crate) fn take_request(&self) -> bool {
        self.shared.cancel_requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, to: ScanState) -> Result<(), RecoveryError> {
        self.shared.set_state(to)
    }
}

/// Walks height ranges of a ledger and emits observations.
pub struct BlockScanner<L> {
    ledger: L,
    handle: CancelHandle,
    last_height: Option<u64>,
}

impl<L: LedgerSource> BlockScanner<L> {
    pub fn new(ledger: L) -> Self {
        Self {
            ledger,
            handle: CancelHandle::new(),
            last_height: None,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn state(&self) -> ScanState {
        self.handle.state()
    }

    /// Handle for requesting cancellation from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Request a cooperative stop; see [`CancelHandle::cancel`].
    pub fn cancel(&self) -> Result<(), RecoveryError> {
        self.handle.cancel()
    }

    /// Last height whose observations were fully delivered.
    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Scan `start_height..=end_height` to the end, ignoring halt requests.
    ///
    /// Returns once the range is exhausted or a cancellation was honored;
    /// [`BlockScanner::state`] tells the two apart.
    pub async fn scan<O>(&mut self, start_height: u64, end_height: u64, observer: &mut O) -> anyhow::Result<()>
    where
        O: ScanObserver + ?Sized + Send,
    {
        self.run(start_height, end_height, observer, false).await?;
        Ok(())
    }

    /// Scan `start_height..=end_height`, stopping early when an observer
    /// halts or cancellation is requested.
    pub async fn scan_reentrant<O>(
        &mut self,
        start_height: u64,
        end_height: u64,
        observer: &mut O,
    ) -> anyhow::Result<ScanOutcome>
    where
        O: ScanObserver + ?Sized + Send,
    {
        self.run(start_height, end_height, observer, true).await
    }

    async fn run<O>(
        &mut self,
        start_height: u64,
        end_height: u64,
        observer: &mut O,
        honor_halt: bool,
    ) -> anyhow::Result<ScanOutcome>
    where
        O: ScanObserver + ?Sized + Send,
    {
        self.handle.set_state(ScanState::Scanning)?;
        info!("Scanning blocks {} to {}", start_height, end_height);
        observer.on_event(&ScanEvent::Start);

        for height in start_height..=end_height {
            let block = match self.fetch(height).await {
                Ok(block) => block,
                Err(e) => {
                    self.handle.set_state(ScanState::Canceled)?;
                    return Err(e);
                }
            };

            let flow = observe_block(&block, observer);
            self.last_height = Some(height);
            trace!(
                "Delivered block {} ({} transactions)",
                height,
                block.transactions.len()
            );

            let halted = honor_halt && flow.is_halt();
            if self.handle.take_request() {
                self.handle.set_state(ScanState::Canceled)?;
                let resume_height = if halted { height } else { height + 1 };
                info!("Scan canceled after block {}", height);
                return Ok(ScanOutcome::Canceled { resume_height });
            }
            if halted {
                self.handle.set_state(ScanState::Canceled)?;
                debug!("Observer halted scan at block {}", height);
                return Ok(ScanOutcome::Halted {
                    resume_height: height,
                });
            }
        }

        self.handle.set_state(ScanState::Complete)?;
        observer.on_event(&ScanEvent::Complete);
        info!("Scan complete at height {}", end_height);

        Ok(ScanOutcome::Complete)
    }

    async fn fetch(&self, height: u64) -> anyhow::Result<Block> {
        let block = self.ledger.block_at(height).await?;
        if block.height != height {
            return Err(RecoveryError::MalformedLedgerData(format!(
                "requested block {} but ledger returned height {}",
                height, block.height
            ))
            .into());
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::types::{Transaction, TxInput, TxOutput};

    /// Records events as strings for easy comparison.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        halt_on_address: Option<String>,
    }

    impl ScanObserver for Recorder {
        fn on_event(&mut self, event: &ScanEvent<'_>) -> Continuation {
            let line = match event {
                ScanEvent::Start => "start".to_string(),
                ScanEvent::Block { height, .. } => format!("block {}", height),
                ScanEvent::Receive {
                    address, outpoint, ..
                } => format!("receive {} {}", address, outpoint),
                ScanEvent::Spend { outpoint, inpoint } => format!("spend {} {}", outpoint, inpoint),
                ScanEvent::Complete => "complete".to_string(),
            };
            self.events.push(line);

            match (event, &self.halt_on_address) {
                (ScanEvent::Receive { address, .. }, Some(target)) if *address == target.as_str() => {
                    Continuation::Halt
                }
                _ => Continuation::Continue,
            }
        }
    }

    fn sample_ledger() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.push_block(vec![Transaction::new(
            "cb1",
            vec![TxInput::Coinbase],
            vec![TxOutput::to_address(50, "a0")],
        )]);
        ledger.push_block(vec![
            Transaction::new(
                "cb2",
                vec![TxInput::Coinbase],
                vec![TxOutput::new(50, vec![])],
            ),
            Transaction::new(
                "t2",
                vec![TxInput::spend("cb1", 0), TxInput::spend("zz", 7)],
                vec![
                    TxOutput::to_address(20, "a1"),
                    TxOutput::new(30, vec!["m0".into(), "m1".into()]),
                ],
            ),
        ]);
        ledger.extend_to(4);
        ledger
    }

    #[test]
    fn test_transitions() {
        use ScanState::*;

        assert_eq!(Pending.transition(Scanning).unwrap(), Scanning);
        assert_eq!(Scanning.transition(Canceled).unwrap(), Canceled);
        assert_eq!(Scanning.transition(Complete).unwrap(), Complete);
        assert_eq!(Complete.transition(Scanning).unwrap(), Scanning);
        assert_eq!(Canceled.transition(Scanning).unwrap(), Scanning);

        assert!(Complete.transition(Canceled).is_err());
        assert!(Pending.transition(Complete).is_err());
        assert!(Scanning.transition(Scanning).is_err());
        assert!(Canceled.transition(Pending).is_err());
    }

    #[test]
    fn test_observe_block_order() {
        let ledger = sample_ledger();
        let block = block_from(&ledger, 2);
        let mut recorder = Recorder::default();

        let flow = observe_block(&block, &mut recorder);

        assert_eq!(flow, Continuation::Continue);
        assert_eq!(
            recorder.events,
            vec![
                "block 2",
                "spend cb1:0 t2:0",
                "spend zz:7 t2:1",
                "receive a1 t2:0",
                "receive m0 t2:1",
                "receive m1 t2:1",
            ]
        );
    }

    #[test]
    fn test_coinbase_and_addressless_outputs_are_silent() {
        let block = Block::new(
            "h",
            9,
            vec![Transaction::new(
                "cb",
                vec![TxInput::Coinbase],
                vec![TxOutput::new(1, vec![]), TxOutput::new(2, vec![])],
            )],
        );
        let mut recorder = Recorder::default();
        observe_block(&block, &mut recorder);
        assert_eq!(recorder.events, vec!["block 9"]);
    }

    #[test]
    fn test_coinbase_reward_is_received_not_spent() {
        let block = Block::new(
            "h",
            3,
            vec![Transaction::new(
                "cb",
                vec![TxInput::Coinbase],
                vec![TxOutput::to_address(50, "m0")],
            )],
        );
        let mut recorder = Recorder::default();
        observe_block(&block, &mut recorder);
        assert_eq!(recorder.events, vec!["block 3", "receive m0 cb:0"]);
    }

    #[tokio::test]
    async fn test_linear_scan_completes() {
        let ledger = sample_ledger();
        let mut scanner = BlockScanner::new(&ledger);
        let mut recorder = Recorder::default();

        assert_eq!(scanner.state(), ScanState::Pending);
        scanner.scan(1, 4, &mut recorder).await.unwrap();

        assert_eq!(scanner.state(), ScanState::Complete);
        assert_eq!(scanner.last_height(), Some(4));
        assert_eq!(recorder.events.first().unwrap(), "start");
        assert_eq!(recorder.events.last().unwrap(), "complete");
        let blocks: Vec<_> = recorder
            .events
            .iter()
            .filter(|e| e.starts_with("block"))
            .cloned()
            .collect();
        assert_eq!(blocks, vec!["block 1", "block 2", "block 3", "block 4"]);
    }

    #[tokio::test]
    async fn test_linear_scan_ignores_halt() {
        let ledger = sample_ledger();
        let mut scanner = BlockScanner::new(&ledger);
        let mut recorder = Recorder {
            halt_on_address: Some("a0".into()),
            ..Default::default()
        };

        scanner.scan(1, 4, &mut recorder).await.unwrap();
        assert_eq!(scanner.state(), ScanState::Complete);
    }

    #[tokio::test]
    async fn test_reentrant_halt_returns_same_height() {
        let ledger = sample_ledger();
        let mut scanner = BlockScanner::new(&ledger);
        let mut recorder = Recorder {
            halt_on_address: Some("a1".into()),
            ..Default::default()
        };

        let outcome = scanner.scan_reentrant(1, 4, &mut recorder).await.unwrap();

        assert_eq!(outcome, ScanOutcome::Halted { resume_height: 2 });
        assert_eq!(scanner.state(), ScanState::Canceled);
        // the halted block was still delivered in full
        assert_eq!(recorder.events.last().unwrap(), "receive m1 t2:1");
        assert!(!recorder.events.contains(&"complete".to_string()));

        // resuming from the returned height reprocesses block 2
        recorder.halt_on_address = None;
        recorder.events.clear();
        let outcome = scanner.scan_reentrant(2, 4, &mut recorder).await.unwrap();
        assert_eq!(outcome, ScanOutcome::Complete);
        assert_eq!(recorder.events[1], "block 2");
    }

    #[tokio::test]
    async fn test_cancel_is_observed_between_blocks() {
        let ledger = sample_ledger();
        let mut scanner = BlockScanner::new(&ledger);
        let handle = scanner.cancel_handle();

        let mut observer = |event: &ScanEvent<'_>| {
            if let ScanEvent::Block { height: 2, .. } = event {
                handle.cancel().unwrap();
            }
            Continuation::Continue
        };

        let outcome = scanner.scan_reentrant(1, 4, &mut observer).await.unwrap();

        assert_eq!(outcome, ScanOutcome::Canceled { resume_height: 3 });
        assert_eq!(scanner.state(), ScanState::Canceled);
        assert_eq!(scanner.last_height(), Some(2));
        assert!(!scanner.cancel_handle().is_cancel_requested());
    }

    #[tokio::test]
    async fn test_linear_cancel() {
        let ledger = sample_ledger();
        let mut scanner = BlockScanner::new(&ledger);
        let handle = scanner.cancel_handle();

        // requested before the scan starts: honored after the first block
        handle.cancel().unwrap();
        let mut blocks = 0;
        let mut observer = |event: &ScanEvent<'_>| {
            if matches!(event, ScanEvent::Block { .. }) {
                blocks += 1;
            }
            Continuation::Continue
        };
        scanner.scan(1, 4, &mut observer).await.unwrap();

        assert_eq!(blocks, 1);
        assert_eq!(scanner.state(), ScanState::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_after_complete_rejected() {
        let ledger = sample_ledger();
        let mut scanner = BlockScanner::new(&ledger);
        let mut recorder = Recorder::default();
        scanner.scan(1, 2, &mut recorder).await.unwrap();

        let err = scanner.cancel().unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::InvalidTransition {
                from: ScanState::Complete,
                to: ScanState::Canceled
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_range_completes() {
        let ledger = sample_ledger();
        let mut scanner = BlockScanner::new(&ledger);
        let mut recorder = Recorder::default();

        let outcome = scanner.scan_reentrant(5, 4, &mut recorder).await.unwrap();

        assert_eq!(outcome, ScanOutcome::Complete);
        assert_eq!(recorder.events, vec!["start", "complete"]);
    }

    #[tokio::test]
    async fn test_ledger_error_propagates() {
        let ledger = sample_ledger();
        ledger.fail_at(3);
        let mut scanner = BlockScanner::new(&ledger);
        let mut recorder = Recorder::default();

        let err = scanner.scan(1, 4, &mut recorder).await.unwrap_err();

        assert!(err.to_string().contains("injected failure"));
        assert_eq!(scanner.last_height(), Some(2));
        assert_eq!(scanner.state(), ScanState::Canceled);
    }

    fn block_from(ledger: &MemoryLedger, height: u64) -> Block {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(ledger.block_at(height))
            .unwrap()
    }
}
