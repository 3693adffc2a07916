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

use std::{collections::BTreeSet, thread};

use alloy_primitives::U256;
use vestake_staking::{StakingGettersHelper, MAIN_STREAM};
use vestake_test_utils::{ether, TestCtx, DAY, LOCK_PERIOD, MAIN_TOKEN, STAKERS, START_TIME};

const GETTERS: StakingGettersHelper = StakingGettersHelper;

#[test]
fn instances_sharing_a_vault_run_in_parallel() {
    let ctx = TestCtx::new();
    let instances: Vec<_> = (0..4).map(|_| ctx.create_instance()).collect();

    thread::scope(|s| {
        for (instance, staker) in instances.iter().zip(STAKERS) {
            s.spawn(move || {
                for i in 0..5 {
                    let unlock = START_TIME + (i + 1) * 30 * DAY;
                    instance.create_lock(staker, ether("10"), unlock).unwrap();
                }
            });
        }
    });

    for (instance, staker) in instances.iter().zip(STAKERS) {
        let locks = GETTERS.get_account_locks(instance, staker).unwrap();
        assert_eq!(locks.iter().map(|lock| lock.id).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(ctx.balance(MAIN_TOKEN, staker), ether("9950"));
    }
    ctx.assert_conservation();

    ctx.advance(10 * DAY);
    thread::scope(|s| {
        for (instance, staker) in instances.iter().zip(STAKERS) {
            s.spawn(move || {
                instance.claim_all_rewards(staker, 1).unwrap();
                instance.withdraw(staker, 2).unwrap();
            });
        }
    });
    ctx.assert_conservation();
}

#[test]
fn concurrent_stakers_on_one_instance() {
    let ctx = TestCtx::new();
    let instance = ctx.create_instance();

    thread::scope(|s| {
        for staker in STAKERS {
            let instance = &instance;
            s.spawn(move || {
                for _ in 0..5 {
                    instance.create_lock(staker, ether("7"), START_TIME + LOCK_PERIOD).unwrap();
                }
            });
        }
    });

    let mut ids = BTreeSet::new();
    let mut shares = U256::ZERO;
    for staker in STAKERS {
        for lock in GETTERS.get_account_locks(&instance, staker).unwrap() {
            assert_eq!(lock.owner, staker);
            assert!(ids.insert(lock.id), "lock id {} handed out twice", lock.id);
            shares += lock.stream_shares;
        }
    }
    assert_eq!(ids, (1..=20).collect::<BTreeSet<_>>());
    assert_eq!(GETTERS.get_total_stream_shares(&instance).unwrap(), shares);
    ctx.assert_conservation();

    // Readers and writers interleave while the clock moves forward.
    ctx.advance(DAY);
    thread::scope(|s| {
        for (i, staker) in STAKERS.into_iter().enumerate() {
            let instance = &instance;
            let ctx = &ctx;
            s.spawn(move || {
                let lock_id = GETTERS.get_account_locks(instance, staker).unwrap()[0].id;
                for _ in 0..3 {
                    ctx.advance(60);
                    let _ = GETTERS.get_pending_rewards(instance, lock_id, MAIN_STREAM).unwrap();
                    instance.claim_rewards(staker, lock_id, MAIN_STREAM).unwrap();
                }
                if i % 2 == 0 {
                    instance.withdraw(staker, lock_id).unwrap();
                }
            });
        }
    });

    let main = GETTERS.get_stream(&instance, MAIN_STREAM).unwrap().state;
    assert!(main.claimed > U256::ZERO);
    let active = GETTERS.get_instance_summary(&instance).unwrap().active_lock_count;
    assert_eq!(active, 18);
    ctx.assert_conservation();
}
