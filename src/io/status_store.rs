//! Status document storage: integrity-checked load/save, recursive fractal
//! ref resolution with cycle detection, and the process writer lock.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::{document, selector};
use crate::error::{FlowError, Result};
use crate::io::integrity::IntegrityStore;
use crate::io::paths::FlowPaths;
use crate::io::safe_path;
use crate::tree::{StatusTree, Task, TaskStatus};

pub const STATUS_FILE: &str = "status.md";

/// Most sub-status files one load may traverse (expansion-bomb guard).
const REF_VISIT_CAP: usize = 20;

const WRITER_LOCK_POLL: Duration = Duration::from_millis(50);

/// The deepest runnable task, with the document chain that led to it.
#[derive(Debug, Clone)]
pub struct ActiveCursor {
    /// Owning document: `None` for the root `status.md`, else the ref path.
    pub doc: Option<String>,
    /// Task ids walked at each document level to reach this task.
    pub chain: Vec<String>,
    pub task: Task,
}

impl ActiveCursor {
    /// State-file identity: chain ids joined with `#`.
    pub fn state_id(&self) -> String {
        self.chain.join("#")
    }
}

#[derive(Debug)]
pub struct StatusStore {
    flow_dir: PathBuf,
    integrity: IntegrityStore,
    depth_cap: usize,
    writer_lock_path: PathBuf,
}

impl StatusStore {
    pub fn new(paths: &FlowPaths, depth_cap: usize, backups_keep: usize) -> Self {
        Self {
            flow_dir: paths.flow_dir.clone(),
            integrity: IntegrityStore::new(&paths.flow_dir, backups_keep),
            depth_cap,
            writer_lock_path: paths.writer_lock_path.clone(),
        }
    }

    /// Load and fully validate the root document, including every reachable
    /// sub-document (grammar, tree rules, ref cycles, expansion cap).
    pub fn load(&self) -> Result<StatusTree> {
        let tree = self.load_root()?;
        let root_path = canonical(&self.flow_dir.join(STATUS_FILE));
        let mut visited = HashSet::from([root_path]);
        self.validate_refs(&tree, &mut visited)?;
        Ok(tree)
    }

    /// Load the root document through the integrity store, without the
    /// recursive ref walk. Missing file is an empty tree.
    pub fn load_root(&self) -> Result<StatusTree> {
        let path = self.flow_dir.join(STATUS_FILE);
        if !path.exists() {
            debug!("no status.md; starting with an empty tree");
            return Ok(StatusTree::new());
        }
        let bytes = self.integrity.load(STATUS_FILE)?;
        document::parse_with_depth(&bytes, self.depth_cap)
    }

    /// Load a sub-status document (jailed under the data directory).
    pub fn load_doc(&self, rel: &str) -> Result<StatusTree> {
        let path = safe_path::resolve(&self.flow_dir, rel)?;
        let bytes = fs::read(&path)?;
        document::parse_with_depth(&bytes, self.depth_cap)
    }

    pub fn load_doc_or_root(&self, doc: Option<&str>) -> Result<StatusTree> {
        match doc {
            Some(rel) => self.load_doc(rel),
            None => self.load_root(),
        }
    }

    /// Save the root document: serialize, backup, atomic write, sidecar.
    pub fn save(&self, tree: &StatusTree) -> Result<()> {
        let bytes = document::serialize(tree)?;
        self.integrity.save(STATUS_FILE, &bytes)
    }

    /// Save a sub-status document (atomic write, no sidecar).
    pub fn save_doc(&self, rel: &str, tree: &StatusTree) -> Result<()> {
        let path = safe_path::resolve(&self.flow_dir, rel)?;
        let bytes = document::serialize(tree)?;
        super::write_atomic(&path, &bytes)
    }

    pub fn save_doc_or_root(&self, doc: Option<&str>, tree: &StatusTree) -> Result<()> {
        match doc {
            Some(rel) => self.save_doc(rel, tree),
            None => self.save(tree),
        }
    }

    /// Accept hand-edited bytes as authoritative.
    pub fn accept(&self) -> Result<()> {
        self.integrity.accept(STATUS_FILE)
    }

    /// Restore the newest backup over a tampered document.
    pub fn decline(&self) -> Result<()> {
        self.integrity.decline(STATUS_FILE)
    }

    /// Locate the deepest runnable task across the fractal document chain.
    ///
    /// The deepest active task wins; an active task with a ref descends into
    /// the sub-document. With no active task anywhere, Smart Resume picks the
    /// document-order-first pending task of the root document.
    pub fn find_active(&self) -> Result<Option<ActiveCursor>> {
        let tree = self.load()?;
        let cursor = self.descend(&tree, None, Vec::new(), 0)?;
        if cursor.is_some() {
            return Ok(cursor);
        }
        Ok(selector::first_pending(&tree).map(|task| ActiveCursor {
            doc: None,
            chain: vec![task.id.clone()],
            task: task.clone(),
        }))
    }

    fn descend(
        &self,
        tree: &StatusTree,
        doc: Option<&str>,
        chain: Vec<String>,
        depth: usize,
    ) -> Result<Option<ActiveCursor>> {
        if depth >= REF_VISIT_CAP {
            return Err(FlowError::Validation(
                "Max Recursion Depth Exceeded while following refs".to_string(),
            ));
        }
        let Some(active) = selector::deepest_active(tree) else {
            return Ok(None);
        };

        let mut chain_here = chain.clone();
        chain_here.push(active.id.clone());

        if let Some(ref_path) = active.ref_path.as_deref().filter(|r| r.ends_with(".md")) {
            match self.load_doc(ref_path) {
                Ok(sub_tree) => {
                    if let Some(deep) =
                        self.descend(&sub_tree, Some(ref_path), chain_here.clone(), depth + 1)?
                    {
                        return Ok(Some(deep));
                    }
                    // Sub-flow has no focus yet: resume at its first pending.
                    if let Some(pending) = selector::first_pending(&sub_tree) {
                        let mut chain = chain_here.clone();
                        chain.push(pending.id.clone());
                        return Ok(Some(ActiveCursor {
                            doc: Some(ref_path.to_string()),
                            chain,
                            task: pending.clone(),
                        }));
                    }
                    // Exhausted sub-flow: surface the proxy for the engine to
                    // close out.
                }
                Err(err) => {
                    warn!(%ref_path, %err, "sub-status unreadable; using proxy task");
                }
            }
        }

        Ok(Some(ActiveCursor {
            doc: doc.map(str::to_string),
            chain: chain_here,
            task: active.clone(),
        }))
    }

    /// Walk every ref reachable from `tree`, enforcing existence for active
    /// tasks, cycle-freedom, and the visit cap.
    fn validate_refs(&self, tree: &StatusTree, visited: &mut HashSet<PathBuf>) -> Result<()> {
        self.validate_ref_group(&tree.roots, visited)
    }

    fn validate_ref_group(&self, tasks: &[Task], visited: &mut HashSet<PathBuf>) -> Result<()> {
        for task in tasks {
            if let Some(ref_path) = &task.ref_path {
                let resolved = safe_path::resolve(&self.flow_dir, ref_path)
                    .map_err(|err| match err {
                        FlowError::Security(sec) => FlowError::Validation(format!(
                            "Jailbreak attempt: ref '{ref_path}' rejected ({sec})"
                        )),
                        other => other,
                    })?;
                let canonical = canonical(&resolved);

                if visited.contains(&canonical) {
                    return Err(FlowError::Validation(format!(
                        "Cycle detected: {ref_path} loops back to {}",
                        canonical
                            .file_name()
                            .unwrap_or_default()
                            .to_string_lossy()
                    )));
                }

                if resolved.exists() {
                    if visited.len() >= REF_VISIT_CAP {
                        return Err(FlowError::Validation(
                            "Max Recursion Depth Exceeded".to_string(),
                        ));
                    }
                    visited.insert(canonical.clone());
                    let sub_tree = self.load_doc(ref_path)?;
                    self.validate_refs(&sub_tree, visited)?;
                    visited.remove(&canonical);
                } else if task.status == TaskStatus::Active {
                    return Err(FlowError::Validation(format!(
                        "Missing sub-status file: {ref_path}"
                    )));
                }
            }
            self.validate_ref_group(&task.children, visited)?;
        }
        Ok(())
    }

    /// Single-writer guard for the whole document directory.
    ///
    /// A second engine on the same root waits up to `deadline` then exits
    /// `ResourceBusy`; locks from dead processes are stolen.
    pub fn acquire_writer_lock(&self, deadline: Duration) -> Result<WriterLock> {
        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.writer_lock_path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(WriterLock {
                        path: self.writer_lock_path.clone(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = read_lock_pid(&self.writer_lock_path) {
                        if pid != std::process::id() && !super::intent::pid_alive(pid) {
                            warn!(pid, "stealing writer lock from dead process");
                            let _ = fs::remove_file(&self.writer_lock_path);
                            continue;
                        }
                    }
                    if started.elapsed() >= deadline {
                        return Err(FlowError::ResourceBusy(format!(
                            "another engine holds {}",
                            self.writer_lock_path.display()
                        )));
                    }
                    std::thread::sleep(WRITER_LOCK_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_lock_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProject;

    fn store(project: &TestProject) -> StatusStore {
        let paths = FlowPaths::new(project.root());
        StatusStore::new(&paths, document::DEFAULT_MAX_DEPTH, 10)
    }

    #[test]
    fn load_missing_status_is_empty_tree() {
        let project = TestProject::new();
        fs::remove_file(project.flow_dir().join(STATUS_FILE)).expect("remove");
        let tree = store(&project).load().expect("load");
        assert!(tree.roots.is_empty());
    }

    #[test]
    fn save_then_load_round_trips_with_integrity() {
        let project = TestProject::new();
        let store = store(&project);
        let tree = document::parse(b"- [ ] Phase 1\n    - [ ] Task A\n").expect("parse");
        store.save(&tree).expect("save");
        assert_eq!(store.load().expect("load"), tree);
        assert!(project.flow_dir().join("status.meta").exists());
    }

    #[test]
    fn hand_edit_is_tamper_until_accepted() {
        let project = TestProject::new();
        let store = store(&project);
        store
            .save(&document::parse(b"- [ ] A\n").expect("parse"))
            .expect("save");
        project.write_status("- [x] A\n");

        let err = store.load().expect_err("should detect tamper");
        assert!(matches!(err, FlowError::Integrity { .. }), "{err}");

        store.accept().expect("accept");
        let tree = store.load().expect("load after accept");
        assert_eq!(tree.roots[0].status, TaskStatus::Done);
    }

    #[test]
    fn decline_restores_the_previous_version() {
        let project = TestProject::new();
        let store = store(&project);
        store
            .save(&document::parse(b"- [ ] A\n").expect("parse"))
            .expect("save v1");
        store
            .save(&document::parse(b"- [/] A\n").expect("parse"))
            .expect("save v2");
        project.write_status("- [x] A\nvandalized\n");

        store.decline().expect("decline");
        let tree = store.load().expect("load");
        assert_eq!(tree.roots[0].status, TaskStatus::Pending);
    }

    #[test]
    fn active_ref_to_missing_file_fails_load() {
        let project = TestProject::new();
        project.write_status("- [/] Task @ missing.md\n");
        let err = store(&project).load().expect_err("should fail");
        assert!(err.to_string().contains("Missing sub-status"), "{err}");
    }

    #[test]
    fn pending_ref_to_missing_file_is_tolerated() {
        let project = TestProject::new();
        project.write_status("- [ ] Task @ future.md\n");
        store(&project).load().expect("load");
    }

    #[test]
    fn ref_cycle_is_detected() {
        let project = TestProject::new();
        project.write_status("- [/] A @ b.md\n");
        project.write_doc("b.md", "- [/] B @ status.md\n");
        let err = store(&project).load().expect_err("should fail");
        assert!(err.to_string().contains("Cycle detected"), "{err}");
    }

    #[test]
    fn traversal_ref_is_rejected_before_io() {
        let project = TestProject::new();
        project.write_status("- [ ] Hack @ ../../etc/passwd\n");
        let err = store(&project).load().expect_err("should fail");
        assert!(err.to_string().contains("Jailbreak"), "{err}");
    }

    #[test]
    fn find_active_drills_through_fractal_refs() {
        let project = TestProject::new();
        project.write_status("- [/] Phase 1 @ a.md\n");
        project.write_doc("a.md", "- [/] Phase 2 @ b.md\n");
        project.write_doc("b.md", "- [x] Setup\n- [/] Target Task\n");

        let cursor = store(&project)
            .find_active()
            .expect("find")
            .expect("cursor");
        assert_eq!(cursor.task.name, "Target Task");
        assert_eq!(cursor.doc.as_deref(), Some("b.md"));
        assert_eq!(cursor.chain, vec!["1", "1", "2"]);
        assert_eq!(cursor.state_id(), "1#1#2");
    }

    #[test]
    fn find_active_resumes_pending_inside_sub_flow() {
        let project = TestProject::new();
        project.write_status("- [/] Phase 1 @ a.md\n");
        project.write_doc("a.md", "- [x] Done step\n- [ ] Next step\n");

        let cursor = store(&project)
            .find_active()
            .expect("find")
            .expect("cursor");
        assert_eq!(cursor.task.name, "Next step");
        assert_eq!(cursor.state_id(), "1#2");
    }

    #[test]
    fn smart_resume_picks_first_pending_without_focus() {
        let project = TestProject::new();
        project.write_status("- [x] Phase 1\n- [ ] Phase 2\n");
        let cursor = store(&project)
            .find_active()
            .expect("find")
            .expect("cursor");
        assert_eq!(cursor.task.name, "Phase 2");
        assert_eq!(cursor.doc, None);
    }

    #[test]
    fn find_active_returns_none_when_everything_done() {
        let project = TestProject::new();
        project.write_status("- [x] Phase 1\n");
        assert!(store(&project).find_active().expect("find").is_none());
    }

    #[test]
    fn writer_lock_excludes_second_holder() {
        let project = TestProject::new();
        let store_a = store(&project);
        let lock = store_a
            .acquire_writer_lock(Duration::from_millis(100))
            .expect("first lock");

        // The lock holder's pid is alive (it is ours), so the second
        // acquire cannot steal it and must time out.
        let err = store_a
            .acquire_writer_lock(Duration::from_millis(100))
            .expect_err("should time out");
        assert!(matches!(err, FlowError::ResourceBusy(_)), "{err}");

        drop(lock);
        store_a
            .acquire_writer_lock(Duration::from_millis(100))
            .expect("after release");
    }

    #[test]
    fn writer_lock_steals_from_dead_pid() {
        let project = TestProject::new();
        let store = store(&project);
        fs::write(
            FlowPaths::new(project.root()).writer_lock_path,
            format!("{}\n", u32::MAX - 1),
        )
        .expect("plant lock");
        store
            .acquire_writer_lock(Duration::from_millis(500))
            .expect("steal");
    }
}
