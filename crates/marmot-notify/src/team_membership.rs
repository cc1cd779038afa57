//! Team→member expansion (spec.md §4.J step 1). This workspace owns no
//! user/team directory, so the provider is a narrow trait a deployment
//! wires to whatever identity service it runs — the same boundary
//! pattern as `marmot_rules::SearchBackend` and `marmot_ingest::PluginExecutor`.

use async_trait::async_trait;
use marmot_common::error::Error;
use std::collections::BTreeMap;

#[async_trait]
pub trait TeamMembershipProvider: Send + Sync {
    async fn members_of(&self, team_id: &str) -> Result<Vec<String>, Error>;
}

/// Test/demo provider backed by a fixed team→members map.
#[derive(Default)]
pub struct InMemoryTeamMembershipProvider {
    teams: BTreeMap<String, Vec<String>>,
}

impl InMemoryTeamMembershipProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team(mut self, team_id: &str, members: Vec<String>) -> Self {
        self.teams.insert(team_id.to_string(), members);
        self
    }
}

#[async_trait]
impl TeamMembershipProvider for InMemoryTeamMembershipProvider {
    async fn members_of(&self, team_id: &str) -> Result<Vec<String>, Error> {
        Ok(self.teams.get(team_id).cloned().unwrap_or_default())
    }
}
