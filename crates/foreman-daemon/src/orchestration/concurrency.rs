//! Per-project pipeline slots.
//!
//! The [`ConcurrencyManager`] bounds how many pipelines run at once in each
//! project. Each project gets a Tokio semaphore sized to its limit; a granted
//! [`ProjectSlot`] holds one permit and gives it back when dropped, so every
//! exit path of a run releases its slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Pipelines allowed per project when neither config nor override says.
const DEFAULT_PROJECT_LIMIT: usize = 1;

/// A granted execution slot for one project.
///
/// Dropping the slot releases it.
#[derive(Debug)]
pub struct ProjectSlot {
    project_id: String,
    _permit: OwnedSemaphorePermit,
}

impl ProjectSlot {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Give the slot back explicitly.
    pub fn release(self) {
        debug!(project_id = %self.project_id, "Releasing project slot");
    }
}

/// Outcome of [`ConcurrencyManager::try_acquire`]. Denial is not an error.
#[derive(Debug)]
pub enum Acquire {
    Granted(ProjectSlot),
    Denied { active: usize, limit: usize },
}

impl Acquire {
    pub fn granted(self) -> Option<ProjectSlot> {
        match self {
            Self::Granted(slot) => Some(slot),
            Self::Denied { .. } => None,
        }
    }
}

struct ProjectCounter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Active-pipeline counters per project against configured limits.
pub struct ConcurrencyManager {
    default_limit: usize,
    overrides: HashMap<String, usize>,
    projects: Mutex<HashMap<String, ProjectCounter>>,
}

impl ConcurrencyManager {
    /// Create a manager. A limit of zero falls back to the built-in default.
    pub fn new(default_limit: usize, overrides: HashMap<String, usize>) -> Self {
        Self {
            default_limit: normalize(default_limit),
            overrides,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Configured limit for a project.
    pub fn limit(&self, project_id: &str) -> usize {
        self.overrides
            .get(project_id)
            .map_or(self.default_limit, |n| normalize(*n))
    }

    /// Try to take a slot without waiting.
    pub fn try_acquire(&self, project_id: &str) -> Acquire {
        let mut projects = self.projects.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = projects
            .entry(project_id.to_string())
            .or_insert_with(|| {
                let limit = self.limit(project_id);
                ProjectCounter {
                    semaphore: Arc::new(Semaphore::new(limit)),
                    limit,
                }
            });

        match Arc::clone(&counter.semaphore).try_acquire_owned() {
            Ok(permit) => {
                debug!(project_id, "Project slot granted");
                Acquire::Granted(ProjectSlot {
                    project_id: project_id.to_string(),
                    _permit: permit,
                })
            }
            Err(_) => Acquire::Denied {
                active: counter.limit - counter.semaphore.available_permits(),
                limit: counter.limit,
            },
        }
    }

    /// Pipelines currently holding a slot in a project.
    pub fn active(&self, project_id: &str) -> usize {
        self.projects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
            .map_or(0, |c| c.limit - c.semaphore.available_permits())
    }

    /// Slots in use across all projects.
    pub fn total_active(&self) -> usize {
        self.projects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.limit - c.semaphore.available_permits())
            .sum()
    }
}

const fn normalize(limit: usize) -> usize {
    if limit == 0 {
        DEFAULT_PROJECT_LIMIT
    } else {
        limit
    }
}
