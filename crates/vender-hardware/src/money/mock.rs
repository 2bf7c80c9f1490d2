//! Scripted money device.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vender_core::{Amount, ExpendStrategy, Nominal, NominalGroup};

use crate::error::Result;

use super::poll::{PollItem, PollResult};

#[derive(Debug, Default)]
struct MockMoneyState {
    nominals: Vec<Nominal>,
    polls: VecDeque<Vec<PollItem>>,
    tubes: NominalGroup,
    accept_max: Vec<Amount>,
    escrow: Vec<bool>,
    given: Vec<Amount>,
}

/// Money device answering polls from a queue and giving change from a
/// simulated tube group.
#[derive(Debug, Clone)]
pub struct MockMoneyDevice {
    name: String,
    state: Arc<Mutex<MockMoneyState>>,
}

#[derive(Debug, Clone)]
pub struct MockMoneyHandle {
    state: Arc<Mutex<MockMoneyState>>,
}

fn lock(state: &Mutex<MockMoneyState>) -> MutexGuard<'_, MockMoneyState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockMoneyDevice {
    pub fn new(name: impl Into<String>, nominals: &[Nominal]) -> (Self, MockMoneyHandle) {
        let state = Arc::new(Mutex::new(MockMoneyState {
            nominals: nominals.to_vec(),
            tubes: NominalGroup::with_valid(nominals),
            ..MockMoneyState::default()
        }));
        (
            Self {
                name: name.into(),
                state: state.clone(),
            },
            MockMoneyHandle { state },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supported_nominals(&self) -> Vec<Nominal> {
        lock(&self.state).nominals.clone()
    }

    pub fn poll(&self) -> PollResult {
        PollResult {
            items: lock(&self.state).polls.pop_front().unwrap_or_default(),
            ..PollResult::default()
        }
    }

    pub fn accept_max(&self, max: Amount) {
        lock(&self.state).accept_max.push(max);
    }

    pub fn escrow(&self, accept: bool) {
        lock(&self.state).escrow.push(accept);
    }

    pub fn tubes(&self) -> NominalGroup {
        lock(&self.state).tubes.clone()
    }

    pub fn give(&self, amount: Amount) -> Result<NominalGroup> {
        let mut st = lock(&self.state);
        let mut given = NominalGroup::with_valid(&st.nominals);
        let mut tubes = st.tubes.clone();
        tubes.withdraw(Some(&mut given), amount, &ExpendStrategy::LeastCount)?;
        st.tubes = tubes;
        st.given.push(amount);
        Ok(given)
    }
}

impl MockMoneyHandle {
    pub fn push_poll(&self, items: Vec<PollItem>) {
        lock(&self.state).polls.push_back(items);
    }

    pub fn fill_tubes(&self, nominal: Nominal, count: u32) -> Result<()> {
        lock(&self.state).tubes.add(nominal, count)?;
        Ok(())
    }

    pub fn accept_max_calls(&self) -> Vec<Amount> {
        lock(&self.state).accept_max.clone()
    }

    pub fn escrow_calls(&self) -> Vec<bool> {
        lock(&self.state).escrow.clone()
    }

    pub fn given(&self) -> Vec<Amount> {
        lock(&self.state).given.clone()
    }

    pub fn pending_polls(&self) -> usize {
        lock(&self.state).polls.len()
    }
}
