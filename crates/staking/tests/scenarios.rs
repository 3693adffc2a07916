// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloy_primitives::{address, Address, U256};
use vestake_staking::{
    replay_locks, weights, ErrorKind, LockId, LockStatus, RewardSchedule, StakingCore,
    StakingError, StakingEvent, StakingGettersHelper, StakingProperties, TokenError, VaultError,
    MAIN_STREAM, NATIVE_TOKEN,
};
use vestake_test_utils::{
    default_properties, default_weights, ether, TestCtx, ADMIN, DAY, LOCK_PERIOD, MAIN_TOKEN,
    STAKERS, START_TIME, STREAM_TOKEN, VAULT, VOTE_TOKEN, WXDC,
};

const GETTERS: StakingGettersHelper = StakingGettersHelper;

fn open_lock(instance: &StakingCore, owner: Address, amount: &str, unlock_time: u64) -> LockId {
    instance.create_lock(owner, ether(amount), unlock_time).unwrap().output
}

fn stream_schedule(days: u64, total: &str) -> RewardSchedule {
    RewardSchedule::new(vec![START_TIME, START_TIME + days * DAY], vec![U256::ZERO, ether(total)])
        .unwrap()
}

#[test]
fn full_period_lock_matches_reference_weights() {
    let ctx = TestCtx::new();
    let mut params = ctx.params();
    params.properties(StakingProperties { lock_period_coef: 31_556_926, ..default_properties() });
    let instance = ctx.create_with(&params);
    let alice = STAKERS[0];

    let lock_id =
        instance.create_lock(alice, U256::from(100), START_TIME + 31_556_926).unwrap().output;

    let lock = GETTERS.get_lock(&instance, lock_id).unwrap();
    assert_eq!(lock.voting_power, U256::from(100));
    assert_eq!(lock.stream_shares, U256::from(153_600));
    assert_eq!(GETTERS.get_total_stream_shares(&instance).unwrap(), U256::from(153_600));
    assert_eq!(ctx.balance(VOTE_TOKEN, alice), U256::from(100));
    ctx.assert_conservation();
}

#[test]
fn withdraw_at_unlock_returns_full_principal() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let (alice, bob) = (STAKERS[0], STAKERS[1]);

    let unlock = START_TIME + 30 * DAY;
    let alice_lock = open_lock(&instance, alice, "100", unlock);
    instance.create_lock(bob, ether("50"), START_TIME + LOCK_PERIOD).unwrap();
    let shares = GETTERS.get_lock(&instance, alice_lock).unwrap().stream_shares;
    let total = GETTERS.get_total_stream_shares(&instance).unwrap();

    ctx.clock.set(unlock);
    let receipt = instance.withdraw(alice, alice_lock).unwrap();
    assert_eq!(receipt.output.amount, ether("100"));
    assert_eq!(receipt.output.penalty, U256::ZERO);
    assert_eq!(
        receipt.logs[0].event,
        StakingEvent::LockWithdrawn {
            account: alice,
            lock_id: alice_lock,
            amount: ether("100"),
            penalty: U256::ZERO,
        }
    );

    let lock = GETTERS.get_lock(&instance, alice_lock).unwrap();
    assert_eq!(lock.status, LockStatus::Withdrawn);
    assert_eq!(lock.stream_shares, U256::ZERO);
    assert_eq!(GETTERS.get_total_stream_shares(&instance).unwrap(), total - shares);
    assert_eq!(ctx.balance(MAIN_TOKEN, alice), ether("10000"));
    assert_eq!(ctx.balance(VOTE_TOKEN, alice), U256::ZERO);

    let err = instance.withdraw(alice, alice_lock).unwrap_err();
    assert_eq!(err, StakingError::AlreadyWithdrawn(alice_lock));
    assert_eq!(err.kind(), ErrorKind::State);
    ctx.assert_conservation();
}

#[test]
fn early_withdrawal_at_half_time_pays_interpolated_penalty() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let (alice, bob) = (STAKERS[0], STAKERS[1]);

    let alice_lock = open_lock(&instance, alice, "1000", START_TIME + 200 * DAY);
    let bob_lock = open_lock(&instance, bob, "500", START_TIME + LOCK_PERIOD);

    ctx.advance(100 * DAY);
    // Half the lock remains: w = 100 + 2900 / 2 = 1550, penalty = 1550 * 10 / 200000 = 7.75%.
    let penalty = ether("77.5");
    let preview = GETTERS.preview_withdraw(&instance, alice_lock).unwrap();
    assert_eq!(preview.penalty, penalty);
    assert_eq!(preview.amount, ether("922.5"));

    let bob_before = GETTERS.get_pending_rewards(&instance, bob_lock, MAIN_STREAM).unwrap();
    let withdrawal = instance.withdraw(alice, alice_lock).unwrap().output;
    assert_eq!(withdrawal, preview);
    assert_eq!(ctx.balance(MAIN_TOKEN, alice), ether("10000") - penalty);

    // The penalty is shared with the remaining staker.
    let bob_after = GETTERS.get_pending_rewards(&instance, bob_lock, MAIN_STREAM).unwrap();
    let gained = bob_after - bob_before;
    assert!(gained <= penalty);
    assert!(penalty - gained < U256::from(768_000));
    ctx.assert_conservation();
}

#[test]
fn penalty_shrinks_as_unlock_approaches() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let lock_id =
        instance.create_lock(STAKERS[0], ether("100"), START_TIME + 100 * DAY).unwrap().output;

    let mut previous = GETTERS.preview_withdraw(&instance, lock_id).unwrap().penalty;
    assert!(previous > U256::ZERO);
    for _ in 0..10 {
        ctx.advance(10 * DAY);
        let penalty = GETTERS.preview_withdraw(&instance, lock_id).unwrap().penalty;
        assert!(penalty < previous || penalty.is_zero());
        previous = penalty;
    }
    assert_eq!(previous, U256::ZERO);
}

#[test]
fn two_streams_accrue_independently() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let (alice, bob) = (STAKERS[0], STAKERS[1]);

    let alice_lock = open_lock(&instance, alice, "100", START_TIME + LOCK_PERIOD);
    let bob_lock = open_lock(&instance, bob, "200", START_TIME + LOCK_PERIOD);
    let stream = instance
        .create_stream(ADMIN, STREAM_TOKEN, stream_schedule(100, "300"))
        .unwrap()
        .output;
    assert_eq!(stream, 1);
    ctx.assert_conservation();

    ctx.advance(50 * DAY);
    let alice_claims = instance.claim_all_rewards(alice, alice_lock).unwrap().output;
    let bob_claims = instance.claim_all_rewards(bob, bob_lock).unwrap().output;
    assert_eq!(alice_claims.len(), 2);
    assert_eq!(bob_claims.len(), 2);

    // Bob holds exactly twice Alice's shares.
    let total_shares = U256::from(460_800);
    for (a, b, emitted) in [
        (alice_claims[0], bob_claims[0], ether("500")),
        (alice_claims[1], bob_claims[1], ether("150")),
    ] {
        assert_eq!(a.stream_id, b.stream_id);
        assert_eq!(b.amount, a.amount * U256::from(2));
        assert!(a.amount + b.amount <= emitted);
        assert!(emitted - (a.amount + b.amount) < total_shares);
    }
    assert_eq!(alice_claims[1].reward_token, STREAM_TOKEN);
    assert_eq!(ctx.balance(STREAM_TOKEN, alice), alice_claims[1].amount);
    ctx.assert_conservation();

    // Bob leaves early; from now on Alice earns everything, including his penalty.
    let penalty = instance.withdraw(bob, bob_lock).unwrap().output.penalty;
    let expected_penalty = weights::early_withdrawal_penalty(
        &default_weights(),
        &default_properties(),
        ether("200"),
        START_TIME,
        START_TIME + LOCK_PERIOD,
        START_TIME + 50 * DAY,
    )
    .unwrap();
    assert_eq!(penalty, expected_penalty);

    ctx.advance(50 * DAY);
    let claims = instance.claim_all_rewards(alice, alice_lock).unwrap().output;
    let dust = U256::from(2 * 153_600);
    let main = ether("500") + penalty;
    assert!(claims[0].amount <= main && claims[0].amount + dust >= main);
    let extra = ether("150");
    assert!(claims[1].amount <= extra && claims[1].amount + dust >= extra);
    ctx.assert_conservation();
}

#[test]
fn stream_created_later_only_pays_from_creation() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let alice = STAKERS[0];
    let lock_id = open_lock(&instance, alice, "100", START_TIME + LOCK_PERIOD);

    assert_eq!(
        instance.create_stream(alice, STREAM_TOKEN, stream_schedule(100, "300")).unwrap_err(),
        StakingError::Unauthorized(alice)
    );

    ctx.advance(50 * DAY);
    let schedule = stream_schedule(100, "300");
    let stream = instance.create_stream(ADMIN, STREAM_TOKEN, schedule).unwrap().output;
    let info = GETTERS.get_stream(&instance, stream).unwrap();
    assert_eq!(info.state.undistributed, ether("150"));
    assert_eq!(info.state.reserve, ether("300"));
    assert_eq!(info.rate, ether("3") / U256::from(DAY));

    ctx.advance(50 * DAY);
    let pending = GETTERS.get_pending_rewards(&instance, lock_id, stream).unwrap();
    assert!(pending <= ether("150") && pending + U256::from(153_600) >= ether("150"));
    ctx.assert_conservation();
}

#[test]
fn unsupported_reward_tokens_are_rejected() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let unknown = address!("0x1000000000000000000000000000000000000099");
    ctx.ledger.mint(unknown, ADMIN, ether("300")).unwrap();

    let err = instance.create_stream(ADMIN, unknown, stream_schedule(100, "300")).unwrap_err();
    assert_eq!(err, StakingError::Vault(VaultError::UnsupportedToken(unknown)));
    assert_eq!(GETTERS.get_instance_summary(&instance).unwrap().stream_count, 1);
    assert_eq!(ctx.balance(unknown, ADMIN), ether("300"));
}

#[test]
fn lock_limit_is_enforced() {
    let ctx = TestCtx::new();
    let mut params = ctx.params();
    params.properties(StakingProperties { max_locks: 3, ..default_properties() });
    let instance = ctx.create_with(&params);
    let alice = STAKERS[0];
    let unlock = START_TIME + 10 * DAY;

    let first = open_lock(&instance, alice, "1", unlock);
    instance.create_lock(alice, ether("1"), unlock).unwrap();
    instance.create_lock(alice, ether("1"), unlock).unwrap();
    let err = instance.create_lock(alice, ether("1"), unlock).unwrap_err();
    assert_eq!(err, StakingError::LockLimitExceeded { account: alice, max_locks: 3 });

    // Other accounts are unaffected, and withdrawing frees a slot.
    instance.create_lock(STAKERS[1], ether("1"), unlock).unwrap();
    instance.withdraw(alice, first).unwrap();
    instance.create_lock(alice, ether("1"), unlock).unwrap();
    assert_eq!(GETTERS.get_account_locks(&instance, alice).unwrap().len(), 4);
}

#[test]
fn failed_create_lock_changes_nothing() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let alice = STAKERS[0];
    let unlock = START_TIME + 10 * DAY;

    let err = instance.create_lock(alice, U256::ZERO, unlock).unwrap_err();
    assert_eq!(err, StakingError::ZeroAmount);
    let err = instance.create_lock(alice, ether("1"), START_TIME).unwrap_err();
    assert_eq!(err, StakingError::InvalidUnlockTime { unlock_time: START_TIME, now: START_TIME });
    assert_eq!(err.kind(), ErrorKind::Validation);

    let events = instance.events().unwrap().len();
    let vault_balance = ctx.vault.balance(MAIN_TOKEN).unwrap();
    let err = instance.create_lock(alice, ether("20000"), unlock).unwrap_err();
    assert!(matches!(
        err,
        StakingError::Vault(VaultError::Token(TokenError::InsufficientBalance { account, .. }))
            if account == alice
    ));
    assert_eq!(err.kind(), ErrorKind::Resource);

    assert_eq!(instance.events().unwrap().len(), events);
    assert_eq!(ctx.vault.balance(MAIN_TOKEN).unwrap(), vault_balance);
    assert_eq!(ctx.balance(MAIN_TOKEN, alice), ether("10000"));
    assert_eq!(ctx.balance(VOTE_TOKEN, alice), U256::ZERO);
    assert_eq!(GETTERS.get_total_stream_shares(&instance).unwrap(), U256::ZERO);
    assert!(GETTERS.get_account_locks(&instance, alice).unwrap().is_empty());
    ctx.assert_conservation();
}

#[test]
fn extend_and_increase_recompute_weights() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let (alice, bob) = (STAKERS[0], STAKERS[1]);

    let lock_id = open_lock(&instance, alice, "100", START_TIME + LOCK_PERIOD / 2);
    assert_eq!(GETTERS.get_lock(&instance, lock_id).unwrap().voting_power, ether("50"));

    assert_eq!(
        instance.extend_lock(bob, lock_id, START_TIME + LOCK_PERIOD).unwrap_err(),
        StakingError::NotLockOwner { lock_id, caller: bob }
    );
    assert!(matches!(
        instance.extend_lock(alice, lock_id, START_TIME + LOCK_PERIOD / 4).unwrap_err(),
        StakingError::InvalidUnlockTime { .. }
    ));

    ctx.advance(10 * DAY);
    let extended = instance.extend_lock(alice, lock_id, ctx.now() + LOCK_PERIOD).unwrap().output;
    assert_eq!(extended.voting_power, ether("100"));
    assert_eq!(extended.stream_shares, ether("153600"));
    assert_eq!(extended.lock_start, ctx.now());
    assert_eq!(ctx.balance(VOTE_TOKEN, alice), ether("100"));

    ctx.advance(LOCK_PERIOD / 2);
    let remaining = extended.unlock_time - ctx.now();
    let increased = instance.increase_lock(alice, lock_id, ether("50")).unwrap().output;
    let expected =
        weights::lock_weights(&default_weights(), &default_properties(), ether("150"), remaining)
            .unwrap();
    assert_eq!(increased.principal_amount, ether("150"));
    assert_eq!(increased.unlock_time, extended.unlock_time);
    assert_eq!(increased.voting_power, expected.voting_power);
    assert_eq!(increased.stream_shares, expected.stream_shares);
    assert_eq!(ctx.balance(VOTE_TOKEN, alice), expected.voting_power);
    assert_eq!(GETTERS.get_total_stream_shares(&instance).unwrap(), expected.stream_shares);
    assert_eq!(
        GETTERS.get_account_voting_power(&instance, alice).unwrap(),
        expected.voting_power
    );

    let err = instance.increase_lock(alice, lock_id, U256::ZERO).unwrap_err();
    assert_eq!(err, StakingError::ZeroAmount);
    let err = instance.increase_lock(alice, 99, ether("1")).unwrap_err();
    assert_eq!(err, StakingError::LockNotFound(99));

    ctx.clock.set(increased.unlock_time);
    assert_eq!(
        instance.increase_lock(alice, lock_id, ether("1")).unwrap_err(),
        StakingError::LockExpired(lock_id)
    );
    instance.withdraw(alice, lock_id).unwrap();
    assert_eq!(
        instance.increase_lock(alice, lock_id, ether("1")).unwrap_err(),
        StakingError::AlreadyWithdrawn(lock_id)
    );
    assert_eq!(
        instance.extend_lock(alice, lock_id, ctx.now() + DAY).unwrap_err(),
        StakingError::AlreadyWithdrawn(lock_id)
    );
    ctx.assert_conservation();
}

#[test]
fn claim_rules() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let (alice, bob) = (STAKERS[0], STAKERS[1]);
    let lock_id = open_lock(&instance, alice, "100", START_TIME + 20 * DAY);

    assert_eq!(
        instance.claim_rewards(alice, lock_id, MAIN_STREAM).unwrap_err(),
        StakingError::NothingToClaim(lock_id)
    );
    let err = instance.claim_rewards(alice, lock_id, 5).unwrap_err();
    assert_eq!(err, StakingError::UnknownStream(5));
    assert_eq!(
        instance.claim_all_rewards(alice, lock_id).unwrap_err(),
        StakingError::NothingToClaim(lock_id)
    );

    ctx.advance(10 * DAY);
    assert_eq!(
        instance.claim_rewards(bob, lock_id, MAIN_STREAM).unwrap_err().kind(),
        ErrorKind::Authorization
    );
    let claimed = instance.claim_rewards(alice, lock_id, MAIN_STREAM).unwrap().output;
    // Alone in the instance, Alice earns the whole emission up to rounding.
    assert!(claimed <= ether("100") && claimed + U256::from(1_000_000) >= ether("100"));
    assert_eq!(ctx.balance(MAIN_TOKEN, alice), ether("9900") + claimed);
    assert_eq!(
        instance.claim_rewards(alice, lock_id, MAIN_STREAM).unwrap_err(),
        StakingError::NothingToClaim(lock_id)
    );

    // Rewards settled at withdrawal stay claimable afterwards, and nothing accrues after that.
    ctx.advance(10 * DAY);
    instance.withdraw(alice, lock_id).unwrap();
    let pending = GETTERS.get_pending_rewards(&instance, lock_id, MAIN_STREAM).unwrap();
    assert!(pending > U256::ZERO);
    ctx.advance(10 * DAY);
    assert_eq!(GETTERS.get_pending_rewards(&instance, lock_id, MAIN_STREAM).unwrap(), pending);
    assert_eq!(instance.claim_rewards(alice, lock_id, MAIN_STREAM).unwrap().output, pending);

    let stream = GETTERS.get_stream(&instance, MAIN_STREAM).unwrap().state;
    assert_eq!(stream.claimed, claimed + pending);
    ctx.assert_conservation();
}

#[test]
fn native_locks_wrap_and_unwrap() {
    let ctx = TestCtx::new();
    let instance = ctx.create_native_instance();
    let alice = STAKERS[0];
    let unlock = START_TIME + 30 * DAY;

    let lock_id = instance.create_lock_native(alice, unlock, ether("10")).unwrap().output;
    assert_eq!(ctx.balance(NATIVE_TOKEN, alice), ether("9990"));
    assert_eq!(ctx.balance(WXDC, VAULT), ether("2010"));
    assert_eq!(GETTERS.get_lock(&instance, lock_id).unwrap().principal_amount, ether("10"));

    ctx.clock.set(unlock);
    instance.withdraw(alice, lock_id).unwrap();
    assert_eq!(ctx.balance(NATIVE_TOKEN, alice), ether("10000"));
    assert_eq!(ctx.balance(WXDC, alice), U256::ZERO);
    ctx.assert_conservation();

    let token_instance = ctx.create_instance();
    let err = token_instance.create_lock_native(alice, unlock + DAY, ether("1")).unwrap_err();
    assert_eq!(err, StakingError::NativeLocksUnsupported);
}

#[test]
fn replayed_events_match_getters() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let (alice, bob) = (STAKERS[0], STAKERS[1]);

    let a1 = open_lock(&instance, alice, "10", START_TIME + 100 * DAY);
    let a2 = open_lock(&instance, alice, "20", START_TIME + 200 * DAY);
    let b1 = open_lock(&instance, bob, "30", START_TIME + 300 * DAY);
    ctx.advance(5 * DAY);
    instance.extend_lock(alice, a1, START_TIME + 150 * DAY).unwrap();
    instance.increase_lock(bob, b1, ether("5")).unwrap();
    ctx.advance(5 * DAY);
    instance.withdraw(alice, a2).unwrap();
    instance.claim_all_rewards(bob, b1).unwrap();

    let replayed = replay_locks(instance.address(), &instance.events().unwrap());
    for account in [alice, bob] {
        assert_eq!(replayed[&account], GETTERS.get_account_locks(&instance, account).unwrap());
    }
    assert!(!replayed.contains_key(&STAKERS[2]));
}

#[test]
fn clock_regression_is_rejected() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    ctx.advance(DAY);
    instance.create_lock(STAKERS[0], ether("1"), START_TIME + 10 * DAY).unwrap();

    ctx.clock.set(START_TIME);
    let err = instance.create_lock(STAKERS[0], ether("1"), START_TIME + 10 * DAY).unwrap_err();
    assert_eq!(err, StakingError::ClockRegression { now: START_TIME, last_seen: START_TIME + DAY });
    assert_eq!(err.kind(), ErrorKind::State);
}

#[test]
fn instance_summary_reflects_state() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();
    let lock_id = instance.create_lock(STAKERS[0], ether("10"), START_TIME + DAY).unwrap().output;
    instance.create_lock(STAKERS[1], ether("10"), START_TIME + DAY).unwrap();
    ctx.advance(DAY);
    instance.withdraw(STAKERS[0], lock_id).unwrap();

    let summary = GETTERS.get_instance_summary(&instance).unwrap();
    assert_eq!(summary.address, instance.address());
    assert_eq!(summary.base_token, MAIN_TOKEN);
    assert_eq!(summary.lock_count, 2);
    assert_eq!(summary.active_lock_count, 1);
    assert_eq!(summary.stream_count, 1);
    assert_eq!(summary.total_principal, ether("10"));
    assert_eq!(instance.liabilities(MAIN_TOKEN).unwrap(), ctx.vault.balance(MAIN_TOKEN).unwrap());
}
