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

use std::{io::Write, path::PathBuf};

use anyhow::Context;
use clap::Args;
use serde_json::json;

use crate::scenario::{self, Report, Scenario};

/// Replay a staking scenario against an in-memory deployment.
#[non_exhaustive]
#[derive(Args, Clone, Debug)]
pub struct Simulate {
    /// Path to the scenario YAML file.
    #[clap(long)]
    pub scenario: PathBuf,
    /// Abort on the first failing step instead of recording it and moving on.
    #[clap(long, default_value_t = false)]
    pub fail_fast: bool,
}

impl Simulate {
    pub fn new(scenario: impl Into<PathBuf>) -> Self {
        Self { scenario: scenario.into(), fail_fast: false }
    }

    /// Run the [Simulate] command, writing one JSON line per log and a final summary line.
    pub fn run(&self, out: &mut impl Write) -> anyhow::Result<Report> {
        let scenario = Scenario::load(&self.scenario)?;
        let report = scenario::run(&scenario, self.fail_fast)?;

        for log in &report.logs {
            writeln!(out, "{}", serde_json::to_string(log)?).context("failed to write log")?;
        }
        let summary = json!({
            "summary": report.summary,
            "failures": report.failures,
            "balances": report.balances,
        });
        writeln!(out, "{summary}").context("failed to write summary")?;

        tracing::info!(
            "Replayed {} steps: {} logs, {} failures",
            scenario.steps.len(),
            report.logs.len(),
            report.failures.len()
        );
        Ok(report)
    }
}
