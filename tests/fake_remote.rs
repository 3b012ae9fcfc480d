//! An in-memory stand-in for a CalDAV server, used by the sync scenarios.
//! Every test builds its own instance; nothing here is shared or global.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Mutex;

use async_trait::async_trait;

use caldo::{RemoteSource, Task};

pub struct FakeRemote {
    tasks: Mutex<HashMap<String, Task>>,
    failing: Mutex<bool>,
}

#[allow(dead_code)]
impl FakeRemote {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            failing: Mutex::new(false),
        }
    }

    /// Put a task on the "server" directly, bypassing the sync machinery
    pub fn seed(&self, task: Task) {
        let mut stored = task.clone();
        stored.href = Some(format!("/fake/{}.ics", stored.uid));
        stored.task_index = None;
        self.tasks.lock().unwrap().insert(stored.uid.clone(), stored);
    }

    /// Make every subsequent call fail until turned off again
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn get(&self, uid: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(uid).cloned()
    }

    fn check_up(&self) -> Result<(), Box<dyn Error>> {
        if *self.failing.lock().unwrap() {
            return Err("fake server is down".into());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn list(&self) -> Result<Vec<Task>, Box<dyn Error>> {
        self.check_up()?;
        Ok(self.tasks.lock().unwrap().values().cloned().collect())
    }

    async fn create(&self, task: &Task) -> Result<Task, Box<dyn Error>> {
        self.check_up()?;
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.uid) {
            return Err(format!("task {} already exists", task.uid).into());
        }
        let mut stored = task.clone();
        stored.href = Some(format!("/fake/{}.ics", task.uid));
        stored.task_index = None;
        tasks.insert(task.uid.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, task: &Task) -> Result<Task, Box<dyn Error>> {
        self.check_up()?;
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.contains_key(&task.uid) {
            return Err(format!("task {} does not exist", task.uid).into());
        }
        let mut stored = task.clone();
        stored.href = Some(format!("/fake/{}.ics", task.uid));
        stored.task_index = None;
        tasks.insert(task.uid.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, task: &Task) -> Result<(), Box<dyn Error>> {
        self.check_up()?;
        self.tasks.lock().unwrap().remove(&task.uid);
        Ok(())
    }
}
