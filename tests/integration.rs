//! Integration tests for the state system.

use std::sync::Arc;
use tempfile::TempDir;
use tracestate::query::{
    query_history_range, query_history_range_sampled, query_single_stack_top,
};
use tracestate::{
    open_file_history, BuildState, CancelToken, EventProcessor, FileBackend, FileBackendConfig,
    HistoryBackend, NullBackend, ProcessorConfig, QuarkIterator, StateInterval, StateProvider, StateSystem,
    StateSystemBuilder, StateSystemReader, StateSystemError, StateValue,
};

fn test_config(dir: &TempDir) -> FileBackendConfig {
    FileBackendConfig {
        path: dir.path().join("kernel.ht"),
        ssid: "kernel".to_string(),
        provider_version: 7,
        start_time: 10,
        interval_cache_size: 64,
        sync_interval: 0,
    }
}

fn file_state_system(dir: &TempDir) -> (StateSystem, bool) {
    let (backend, is_new) = FileBackend::open_or_create(test_config(dir)).unwrap();
    let ss = StateSystem::new(Arc::new(backend), is_new).unwrap();
    (ss, is_new)
}

fn bounds(intervals: &[StateInterval]) -> Vec<(i64, i64)> {
    intervals.iter().map(|i| (i.start, i.end)).collect()
}

// --- Basic Scenarios ---

#[test]
fn test_thread_status_scenario() {
    let ss = StateSystem::in_memory("kernel", 10);
    let q = ss.get_or_create_absolute_path("Threads/100").unwrap();

    ss.modify(10, StateValue::from("A"), q).unwrap();
    ss.modify(20, StateValue::from("B"), q).unwrap();
    ss.close_history(30).unwrap();

    let history = query_history_range(&ss, q, 0, 30).unwrap();
    assert_eq!(bounds(&history), vec![(10, 19), (20, 30)]);
    assert_eq!(history[0].value, StateValue::from("A"));
    assert_eq!(history[1].value, StateValue::from("B"));

    assert_eq!(ss.query_single_state(15, q).unwrap().value, StateValue::from("A"));
}

#[test]
fn test_push_pop_scenario() {
    let ss = StateSystem::in_memory("ust", 0);
    let s = ss.get_or_create_absolute(&["Threads", "42", "CallStack"]).unwrap();

    ss.push(5, StateValue::from("x"), s).unwrap();
    assert_eq!(ss.ongoing_value(s).unwrap(), StateValue::Int(1));

    assert_eq!(ss.pop(6, s).unwrap(), Some(StateValue::from("x")));
    assert_eq!(ss.ongoing_value(s).unwrap(), StateValue::Int(0));
}

#[test]
fn test_attribute_namespace() {
    let ss = StateSystem::in_memory("kernel", 0);
    let t100 = ss.get_or_create_absolute(&["Threads", "100"]).unwrap();
    let t200 = ss.get_or_create_absolute_path("Threads/200").unwrap();
    let status = ss.get_or_create_relative(t100, &["Status"]).unwrap();
    ss.get_or_create_relative(t200, &["Status"]).unwrap();
    ss.get_or_create_absolute(&["CPUs", "0"]).unwrap();

    // Creation is idempotent.
    assert_eq!(ss.get_or_create_absolute(&["Threads", "100"]).unwrap(), t100);
    assert_eq!(ss.attribute_count(), 7);

    assert_eq!(ss.full_path(status).unwrap(), "Threads/100/Status");
    assert_eq!(ss.attribute_name(status).unwrap(), "Status");
    assert_eq!(ss.parent_attribute(status).unwrap(), t100);
    assert_eq!(ss.get_absolute_path("Threads/100/Status").unwrap(), status);
    assert!(ss.opt_absolute(&["Threads", "300"]).is_none());
    assert!(matches!(
        ss.get_absolute(&["Threads", "300"]),
        Err(StateSystemError::AttributeNotFound(_))
    ));

    let threads = ss.get_absolute(&["Threads"]).unwrap();
    assert_eq!(ss.sub_attributes(threads, false).unwrap(), vec![t100, t200]);
    assert_eq!(ss.sub_attributes_matching(threads, false, "1.*").unwrap(), vec![t100]);

    let statuses = ss.quarks_matching(&["Threads", "*", "Status"]).unwrap();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0], status);

    let parents = ss.quarks_matching(&["Threads", "*", ".."]).unwrap();
    assert_eq!(parents, vec![threads]);
}

// --- Queries ---

#[test]
fn test_full_state_and_2d() {
    let ss = StateSystem::in_memory("kernel", 0);
    let cpus: Vec<_> = (0..4)
        .map(|i| ss.get_or_create_absolute(&["CPUs", i.to_string().as_str()]).unwrap())
        .collect();

    for (i, &cpu) in cpus.iter().enumerate() {
        for step in 0..5i64 {
            let t = step * 100 + i as i64 * 10;
            ss.modify(t, StateValue::Long(step), cpu).unwrap();
        }
    }

    let full = ss.query_full_state(250).unwrap();
    assert_eq!(full.len(), ss.attribute_count());
    for &cpu in &cpus {
        assert_eq!(full[cpu.index()].value, StateValue::Long(2));
        assert!(full[cpu.index()].contains(250));
    }

    let all = ss.query_2d(&cpus[..2], 150, 350).unwrap();
    assert!(all.iter().all(|i| i.intersects(150, 350)));
    // Steps 1..=3 for each of the two CPUs.
    assert_eq!(all.len(), 6);

    ss.close_history(500).unwrap();
    let all = ss.query_2d(&cpus[..2], 150, 350).unwrap();
    assert_eq!(all.len(), 6);
}

#[test]
fn test_sampled_range_bound() {
    let ss = StateSystem::in_memory("kernel", 0);
    let q = ss.get_or_create_absolute(&["irq"]).unwrap();
    for t in 0..1000 {
        ss.modify(t, StateValue::Int((t % 2) as i32), q).unwrap();
    }
    ss.close_history(1000).unwrap();

    let token = CancelToken::new();
    for resolution in [1, 7, 50, 333, 2000] {
        let sampled = query_history_range_sampled(&ss, q, 100, 900, resolution, &token).unwrap();
        let bound = (800 + resolution - 1) / resolution + 2;
        assert!(sampled.len() as i64 <= bound, "resolution {}", resolution);
        assert!(sampled.first().unwrap().contains(100));
        assert!(sampled.last().unwrap().contains(900));
    }
}

#[test]
fn test_iterator_while_building() {
    let ss = StateSystem::in_memory("kernel", 0);
    let q = ss.get_or_create_absolute(&["cpu"]).unwrap();
    ss.modify(10, StateValue::Int(1), q).unwrap();
    ss.modify(20, StateValue::Int(2), q).unwrap();

    let intervals: Vec<_> = QuarkIterator::new(&ss, q, 0, 100, 1)
        .collect::<tracestate::Result<_>>()
        .unwrap();
    assert_eq!(bounds(&intervals), vec![(0, 9), (10, 19), (20, 20)]);
}

#[test]
fn test_stack_top_history() {
    let ss = StateSystem::in_memory("ust", 0);
    let stack = ss.get_or_create_absolute(&["CallStack"]).unwrap();
    for (t, name) in [(10, "main"), (20, "parse"), (30, "lex")] {
        ss.push(t, StateValue::from(name), stack).unwrap();
    }
    ss.pop(40, stack).unwrap();
    ss.close_history(50).unwrap();

    let top = query_single_stack_top(&ss, 35, stack).unwrap().unwrap();
    assert_eq!(top.value, StateValue::from("lex"));
    let top = query_single_stack_top(&ss, 45, stack).unwrap().unwrap();
    assert_eq!(top.value, StateValue::from("parse"));
}

// --- Backends ---

#[test]
fn test_file_backend_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let (ss, is_new) = file_state_system(&dir);
        assert!(is_new);
        let q = ss.get_or_create_absolute_path("Threads/100").unwrap();
        let cpu = ss.get_or_create_absolute_path("CPUs/0").unwrap();
        ss.modify(10, StateValue::from("A"), q).unwrap();
        ss.modify(20, StateValue::from("B"), q).unwrap();
        ss.modify(25, StateValue::Double(0.5), cpu).unwrap();
        ss.close_history(30).unwrap();
        ss.dispose();
    }

    let (ss, is_new) = file_state_system(&dir);
    assert!(!is_new);
    assert_eq!(ss.build_state(), BuildState::Built);
    assert_eq!((ss.start_time(), ss.current_end_time()), (10, 30));

    let q = ss.get_absolute_path("Threads/100").unwrap();
    let history = query_history_range(&ss, q, 10, 30).unwrap();
    assert_eq!(bounds(&history), vec![(10, 19), (20, 30)]);

    let cpu = ss.get_absolute_path("CPUs/0").unwrap();
    assert!(ss.query_single_state(24, cpu).unwrap().value.is_null());
    assert_eq!(ss.query_single_state(30, cpu).unwrap().value, StateValue::Double(0.5));
}

#[test]
fn test_file_backend_remove_files() {
    let dir = TempDir::new().unwrap();
    let (ss, _) = file_state_system(&dir);
    ss.close_history(20).unwrap();

    ss.remove_files().unwrap();
    assert!(!test_config(&dir).path.exists());
}

#[test]
fn test_null_backend_keeps_ongoing_only() {
    let ss = StateSystem::new(Arc::new(NullBackend::new("null", 0)), true).unwrap();
    let q = ss.get_or_create_absolute(&["a"]).unwrap();
    ss.modify(10, StateValue::Int(1), q).unwrap();
    ss.modify(20, StateValue::Int(2), q).unwrap();

    assert_eq!(ss.query_single_state(20, q).unwrap().value, StateValue::Int(2));
    assert!(ss.query_single_state(15, q).unwrap_err().is_time_range());
    assert_eq!(ss.backend().end_time(), 19);

    // The last interval stays answerable once closed; older ones are gone.
    ss.close_history(30).unwrap();
    let last = ss.query_single_state(25, q).unwrap();
    assert_eq!((last.start, last.end), (20, 30));
    assert_eq!(last.value, StateValue::Int(2));
    assert!(ss.query_single_state(15, q).unwrap_err().is_time_range());
    assert!(ss.query_full_state(15).unwrap_err().is_time_range());
}

#[test]
fn test_attribute_created_after_close_is_null() {
    let ss = StateSystem::in_memory("late", 0);
    let a = ss.get_or_create_absolute(&["a"]).unwrap();
    ss.modify(10, StateValue::Int(1), a).unwrap();
    ss.close_history(30).unwrap();

    let late = ss.get_or_create_absolute(&["late"]).unwrap();
    let interval = ss.query_single_state(15, late).unwrap();
    assert_eq!((interval.start, interval.end), (0, 30));
    assert!(interval.value.is_null());

    let full = ss.query_full_state(15).unwrap();
    assert_eq!(full.len(), 2);
    assert_eq!(full[0].value, StateValue::Int(1));
    assert!(full[1].value.is_null());

    let both = ss.query_2d(&[a, late], 0, 30).unwrap();
    assert_eq!(bounds(&both), vec![(0, 9), (10, 30), (0, 30)]);
}

// --- Event Processing ---

/// Events of a toy scheduler: `(time, cpu, thread)`.
struct SchedProvider {
    version: i32,
    switches: usize,
}

impl SchedProvider {
    fn new(version: i32) -> Self {
        Self {
            version,
            switches: 0,
        }
    }
}

impl StateProvider for SchedProvider {
    type Event = (i64, u32, Option<i32>);

    fn version(&self) -> i32 {
        self.version
    }

    fn event_time(&self, event: &Self::Event) -> i64 {
        event.0
    }

    fn handle_event(&mut self, ss: &StateSystem, event: &Self::Event) -> tracestate::Result<()> {
        let (t, cpu, thread) = *event;
        let cpu = ss.get_or_create_absolute(&["CPUs", cpu.to_string().as_str(), "Current_thread"])?;
        ss.modify(t, StateValue::from(thread), cpu)?;
        self.switches += 1;
        Ok(())
    }
}

#[test]
fn test_provider_builds_history() {
    let ss = Arc::new(StateSystem::in_memory("sched", 0));
    let processor = EventProcessor::start(
        SchedProvider::new(1),
        ss.clone(),
        ProcessorConfig {
            queue_size: 8,
            thread_name: "sched-provider".to_string(),
        },
    )
    .unwrap();

    for t in 0..200 {
        let thread = if t % 3 == 0 { None } else { Some(t as i32) };
        processor.process((t, (t % 2) as u32, thread)).unwrap();
    }
    let provider = processor.finish().unwrap();
    assert_eq!(provider.switches, 200);

    ss.wait_until_built();
    assert_eq!(ss.build_state(), BuildState::Built);
    assert_eq!(ss.current_end_time(), 199);

    let cpu1 = ss.get_absolute_path("CPUs/1/Current_thread").unwrap();
    assert_eq!(ss.query_single_state(102, cpu1).unwrap().value, StateValue::Int(101));
    assert!(ss.query_single_state(4, cpu1).unwrap().value.is_null());
}

/// Build a file history with `provider` from events at `[10, 59]`.
fn build_with_provider(dir: &TempDir, provider: SchedProvider) -> bool {
    let (ss, is_new) = open_file_history(&provider, test_config(dir)).unwrap();
    if is_new {
        let processor = EventProcessor::start(provider, ss.clone(), ProcessorConfig::default())
            .unwrap();
        for t in 10..60 {
            processor.process((t, 0, Some(t as i32))).unwrap();
        }
        processor.finish().unwrap();
    }
    assert_eq!(ss.build_state(), BuildState::Built);
    let cpu = ss.get_absolute_path("CPUs/0/Current_thread").unwrap();
    assert_eq!(ss.query_single_state(42, cpu).unwrap().value, StateValue::Int(42));
    is_new
}

#[test]
fn test_provider_version_decides_reuse() {
    let dir = TempDir::new().unwrap();

    assert!(build_with_provider(&dir, SchedProvider::new(1)));
    // Same version: the finished history is reused.
    assert!(!build_with_provider(&dir, SchedProvider::new(1)));
    // Bumped version: the history is rebuilt.
    assert!(build_with_provider(&dir, SchedProvider::new(2)));
    assert!(!build_with_provider(&dir, SchedProvider::new(2)));
}
