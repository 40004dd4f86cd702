use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use image::DynamicImage;
use tracing::warn;

use crate::decoders::{Decoder, DecodingState};
use crate::events::{EventBus, ImageEvent, ModelEvent, RowRole};
use crate::geometry::Size;
use crate::image::{CheckState, Image, ImageId, ViewFlags};
use crate::pool::{DecodePool, Priority, StateFuture};
use crate::sorting::{SectionKey, SortField, SortOrder};

mod section;

pub use section::{cmp_entries, cmp_sections, section_key, ModelEntry, SectionItem};

/// What a list view draws in a row's decoration slot.
#[derive(Clone)]
pub enum Decoration {
    /// A decode is in flight; draw the animated progress indicator.
    Spinner { percent: u8 },
    Thumbnail(DynamicImage),
    /// No pixels available; the UI maps this label to a file-type icon.
    FileTypeIcon(String),
    None,
}

/// Read-only snapshot of one row.
#[derive(Clone)]
pub struct RowData {
    pub display_name: String,
    pub tooltip: String,
    pub decoration: Decoration,
    pub check_state: CheckState,
    pub is_section: bool,
    pub enabled: bool,
}

/// What a flat index resolves to.
pub enum Row {
    Section(SectionKey),
    Image(ModelEntry),
}

struct ModelState {
    sections: Vec<SectionItem>,
    section_field: SortField,
    section_order: SortOrder,
    image_field: SortField,
    image_order: SortOrder,
    tasks: HashMap<ImageId, StateFuture>,
    checked: HashSet<ImageId>,
}

struct InsertPlan {
    section_pos: usize,
    /// Set when the entry opens a section of its own.
    new_section: Option<SectionKey>,
    item_pos: usize,
    first: usize,
    last: usize,
}

impl ModelState {
    fn row_count(&self) -> usize {
        self.sections.iter().map(SectionItem::row_span).sum()
    }

    fn section_start(&self, section_index: usize) -> usize {
        self.sections[..section_index]
            .iter()
            .map(SectionItem::row_span)
            .sum()
    }

    fn locate_by_path(&self, path: &Path) -> Option<(usize, usize)> {
        for (si, section) in self.sections.iter().enumerate() {
            if let Some(p) = section.position_of(path) {
                return Some((si, p));
            }
        }
        None
    }

    /// Where an entry will land, and which rows that occupies. The plan
    /// only stays valid while no other row mutation runs in between; all
    /// row mutations happen on the directory worker thread.
    fn plan_insert(&self, entry: &ModelEntry) -> InsertPlan {
        let key = section_key(&entry.image, self.section_field);
        match self.sections.iter().position(|s| s.key == key) {
            Some(section_pos) => {
                let item_pos = self.sections[section_pos].insert_position(
                    entry,
                    self.image_field,
                    self.image_order,
                );
                let first = self.section_start(section_pos) + 1 + item_pos;
                InsertPlan {
                    section_pos,
                    new_section: None,
                    item_pos,
                    first,
                    last: first,
                }
            }
            None => {
                let section_pos = self.sections.partition_point(|s| {
                    cmp_sections(&s.key, &key, self.section_order) != std::cmp::Ordering::Greater
                });
                let first = self.section_start(section_pos);
                InsertPlan {
                    section_pos,
                    new_section: Some(key),
                    item_pos: 0,
                    first,
                    last: first + 1,
                }
            }
        }
    }

    fn flat_index_of(&self, id: ImageId) -> Option<usize> {
        let mut idx = 0;
        for section in &self.sections {
            idx += 1;
            for entry in &section.entries {
                if entry.image.id() == id {
                    return Some(idx);
                }
                idx += 1;
            }
        }
        None
    }

    fn row(&self, index: usize) -> Option<Row> {
        let mut idx = index;
        for section in &self.sections {
            if idx == 0 {
                return Some(Row::Section(section.key.clone()));
            }
            idx -= 1;
            if idx < section.entries.len() {
                return Some(Row::Image(section.entries[idx].clone()));
            }
            idx -= section.entries.len();
        }
        None
    }
}

struct CoalescerState {
    deadline: Option<Instant>,
    interval: Duration,
    shutdown: bool,
}

/// Single-shot timer compressing bursts of layout-relevant changes into
/// one LayoutChanged event.
struct LayoutCoalescer {
    state: Arc<(Mutex<CoalescerState>, Condvar)>,
}

const LAYOUT_INTERVAL_DEFAULT: Duration = Duration::from_millis(100);
const LAYOUT_INTERVAL_MIN: Duration = Duration::from_millis(50);
const LAYOUT_INTERVAL_MAX: Duration = Duration::from_secs(5);

impl LayoutCoalescer {
    fn start(model: Weak<ModelShared>) -> Self {
        let state = Arc::new((
            Mutex::new(CoalescerState {
                deadline: None,
                interval: LAYOUT_INTERVAL_DEFAULT,
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let thread_state = state.clone();
        let spawned = std::thread::Builder::new()
            .name("layout-coalescer".to_string())
            .spawn(move || coalescer_loop(thread_state, model));
        if let Err(e) = spawned {
            warn!("failed to spawn the layout coalescer: {e}");
        }
        Self { state }
    }

    fn lock(&self) -> MutexGuard<'_, CoalescerState> {
        match self.state.0.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arms the timer; an already armed timer keeps its deadline.
    fn schedule(&self) {
        let mut st = self.lock();
        if st.deadline.is_none() {
            st.deadline = Some(Instant::now() + st.interval);
            self.state.1.notify_all();
        }
    }

    fn set_interval(&self, interval: Duration) {
        self.lock().interval = interval.clamp(LAYOUT_INTERVAL_MIN, LAYOUT_INTERVAL_MAX);
    }

    fn disarm(&self) {
        self.lock().deadline = None;
    }

    fn stop(&self) {
        let mut st = self.lock();
        st.shutdown = true;
        self.state.1.notify_all();
    }
}

fn coalescer_loop(state: Arc<(Mutex<CoalescerState>, Condvar)>, model: Weak<ModelShared>) {
    let (lock, cond) = &*state;
    let mut st = match lock.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    loop {
        if st.shutdown {
            return;
        }
        match st.deadline {
            None => {
                st = match cond.wait(st) {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let (g, _) = match cond.wait_timeout(st, deadline - now) {
                        Ok(r) => r,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    st = g;
                    continue;
                }
                st.deadline = None;
                drop(st);
                match model.upgrade() {
                    Some(shared) => shared.events.publish(ModelEvent::LayoutChanged),
                    None => return,
                }
                st = match lock.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
    }
}

struct ModelShared {
    events: EventBus<ModelEvent>,
    state: Mutex<ModelState>,
    icon_height: AtomicU32,
    view_flags: AtomicU32,
    layout: Mutex<Option<LayoutCoalescer>>,
}

impl ModelShared {
    fn lock_state(&self) -> MutexGuard<'_, ModelState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_layout(&self, f: impl FnOnce(&LayoutCoalescer)) {
        let guard = match self.layout.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(coalescer) = guard.as_ref() {
            f(coalescer);
        }
    }

    fn data_changed(&self, id: ImageId, roles: &[RowRole]) {
        let index = self.lock_state().flat_index_of(id);
        if let Some(index) = index {
            self.events.publish(ModelEvent::DataChanged {
                first: index,
                last: index,
                roles: roles.to_vec(),
            });
        }
    }

    fn on_image_event(&self, event: &ImageEvent) {
        match event {
            ImageEvent::ThumbnailChanged { image } => {
                self.data_changed(*image, &[RowRole::Decoration]);
                self.with_layout(LayoutCoalescer::schedule);
            }
            ImageEvent::StateChanged { image, new, .. } => match new {
                DecodingState::Error | DecodingState::Fatal => {
                    self.data_changed(*image, &[RowRole::Decoration, RowRole::Tooltip]);
                }
                DecodingState::Metadata => self.data_changed(*image, &[RowRole::Tooltip]),
                _ => {}
            },
            ImageEvent::CheckStateChanged { image } => {
                self.data_changed(*image, &[RowRole::CheckState]);
            }
            _ => {}
        }
    }

    fn clear_task(&self, id: ImageId) {
        let remaining = {
            let mut state = self.lock_state();
            state.tasks.remove(&id);
            state.tasks.len()
        };
        if remaining == 0 {
            self.with_layout(LayoutCoalescer::disarm);
            self.events.publish(ModelEvent::LayoutChanged);
        } else {
            self.with_layout(LayoutCoalescer::schedule);
        }
    }
}

impl Drop for ModelShared {
    fn drop(&mut self) {
        self.with_layout(LayoutCoalescer::stop);
    }
}

/// The sectioned, sorted image model: the single indexed view over all
/// discovered images. Section headers and images share one flat index;
/// events describe every mutation at row granularity.
#[derive(Clone)]
pub struct ImageModel {
    shared: Arc<ModelShared>,
}

impl Default for ImageModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageModel {
    pub fn new() -> Self {
        let shared = Arc::new(ModelShared {
            events: EventBus::new(),
            state: Mutex::new(ModelState {
                sections: Vec::new(),
                section_field: SortField::None,
                section_order: SortOrder::Ascending,
                image_field: SortField::FileName,
                image_order: SortOrder::Ascending,
                tasks: HashMap::new(),
                checked: HashSet::new(),
            }),
            icon_height: AtomicU32::new(150),
            view_flags: AtomicU32::new(0),
            layout: Mutex::new(None),
        });
        let coalescer = LayoutCoalescer::start(Arc::downgrade(&shared));
        *match shared.layout.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        } = Some(coalescer);
        Self { shared }
    }

    pub fn events(&self) -> &EventBus<ModelEvent> {
        &self.shared.events
    }

    pub fn row_count(&self) -> usize {
        self.shared.lock_state().row_count()
    }

    pub fn sort_config(&self) -> (SortField, SortOrder, SortField, SortOrder) {
        let state = self.shared.lock_state();
        (
            state.section_field,
            state.section_order,
            state.image_field,
            state.image_order,
        )
    }

    pub fn view_flags(&self) -> ViewFlags {
        ViewFlags::from_bits_truncate(self.shared.view_flags.load(AtomicOrdering::Relaxed))
    }

    pub fn set_view_flags(&self, flags: ViewFlags) {
        self.shared
            .view_flags
            .store(flags.bits(), AtomicOrdering::Relaxed);
        let rows = self.row_count();
        if rows > 0 {
            self.shared.events.publish(ModelEvent::DataChanged {
                first: 0,
                last: rows - 1,
                roles: vec![RowRole::Flags, RowRole::CheckState],
            });
        }
    }

    pub fn icon_height(&self) -> u32 {
        self.shared.icon_height.load(AtomicOrdering::Relaxed)
    }

    pub fn set_icon_height(&self, height: u32) {
        self.shared
            .icon_height
            .store(height.clamp(16, 4096), AtomicOrdering::Relaxed);
        self.shared.with_layout(LayoutCoalescer::schedule);
    }

    /// The view reports how long its last item layout took; bursts are
    /// coalesced to roughly three times that.
    pub fn record_layout_time(&self, took: Duration) {
        self.shared.with_layout(|l| l.set_interval(took * 3));
    }

    pub fn set_layout_timer_interval(&self, interval: Duration) {
        self.shared.with_layout(|l| l.set_interval(interval));
    }

    /// Registers a freshly discovered image (and its decoder and pending
    /// metadata decode, when present) and inserts it at its sorted
    /// position, emitting the row events around the insertion.
    pub fn welcome_image(
        &self,
        image: Arc<Image>,
        decoder: Option<Arc<Decoder>>,
        watcher: Option<StateFuture>,
    ) {
        let weak = Arc::downgrade(&self.shared);
        image.events().observe(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_image_event(event);
            }
        });

        if let Some(watcher) = &watcher {
            self.register_task(image.id(), watcher.clone());
        }

        let entry = ModelEntry { image, decoder };
        self.insert_entry(entry);
    }

    fn register_task(&self, id: ImageId, watcher: StateFuture) {
        self.shared.lock_state().tasks.insert(id, watcher.clone());
        let weak = Arc::downgrade(&self.shared);
        watcher.on_finished(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.clear_task(id);
            }
        });
    }

    fn insert_entry(&self, entry: ModelEntry) {
        let plan = self.shared.lock_state().plan_insert(&entry);
        let (first, last) = (plan.first, plan.last);
        // a view adapter counts rows between the About-To and the done
        // event, so the source must not contain the new rows yet
        self.shared
            .events
            .publish(ModelEvent::AboutToInsertRows { first, last });
        {
            let mut state = self.shared.lock_state();
            if let Some(key) = plan.new_section {
                state
                    .sections
                    .insert(plan.section_pos, SectionItem::new(key));
            }
            state.sections[plan.section_pos]
                .entries
                .insert(plan.item_pos, entry);
        }
        self.shared
            .events
            .publish(ModelEvent::RowsInserted { first, last });
    }

    /// Removes the image at `path`, cancelling and awaiting its pending
    /// decode first. Check-state and task entries go atomically with it;
    /// an emptied section collapses.
    pub fn remove_image(&self, pool: &DecodePool, path: &Path) -> bool {
        let pending = {
            let state = self.shared.lock_state();
            state.locate_by_path(path).map(|(si, p)| {
                let entry = state.sections[si].entries[p].clone();
                let task = state.tasks.get(&entry.image.id()).cloned();
                (entry, task)
            })
        };
        let Some((entry, task)) = pending else {
            return false;
        };
        if let Some(task) = task {
            match &entry.decoder {
                Some(decoder) => decoder.cancel_or_take(pool, &task),
                None => {
                    task.cancel();
                    task.wait();
                }
            }
        }

        // plan the removal, announce it, then mutate; row mutations stay
        // on the directory worker thread, keeping the plan valid across
        // the About-To event
        let plan = {
            let state = self.shared.lock_state();
            let Some((si, p)) = state.locate_by_path(path) else {
                return false;
            };
            let start = state.section_start(si);
            let (first, last) = if state.sections[si].len() == 1 {
                (start, start + 1)
            } else {
                (start + 1 + p, start + 1 + p)
            };
            (si, p, first, last)
        };
        let (si, p, first, last) = plan;
        self.shared
            .events
            .publish(ModelEvent::AboutToRemoveRows { first, last });
        {
            let mut state = self.shared.lock_state();
            let entry = state.sections[si].entries.remove(p);
            if state.sections[si].is_empty() {
                state.sections.remove(si);
            }
            let id = entry.image.id();
            state.tasks.remove(&id);
            state.checked.remove(&id);
        }
        self.shared
            .events
            .publish(ModelEvent::RowsRemoved { first, last });
        true
    }

    /// Cancels every registered background decode and waits for the
    /// futures to become terminal.
    pub fn cancel_all_background_tasks(&self, pool: &DecodePool) {
        let pending: Vec<(Option<Arc<Decoder>>, StateFuture)> = {
            let state = self.shared.lock_state();
            state
                .tasks
                .iter()
                .map(|(id, fut)| {
                    let decoder = state
                        .sections
                        .iter()
                        .flat_map(|s| s.entries.iter())
                        .find(|e| e.image.id() == *id)
                        .and_then(|e| e.decoder.clone());
                    (decoder, fut.clone())
                })
                .collect()
        };
        self.shared.with_layout(LayoutCoalescer::disarm);
        for (decoder, fut) in pending {
            match decoder {
                Some(decoder) => decoder.cancel_or_take(pool, &fut),
                None => {
                    fut.cancel();
                    fut.wait();
                }
            }
        }
    }

    /// Empties the model (after cancelling all pending work) and emits the
    /// reset pair.
    pub fn clear(&self, pool: &DecodePool) {
        self.cancel_all_background_tasks(pool);
        self.shared.events.publish(ModelEvent::AboutToReset);
        {
            let mut state = self.shared.lock_state();
            state.sections.clear();
            state.tasks.clear();
            state.checked.clear();
        }
        self.shared.events.publish(ModelEvent::Reset);
    }

    pub fn sort_images(&self, field: SortField, order: SortOrder) {
        self.shared.events.publish(ModelEvent::AboutToReset);
        {
            let mut state = self.shared.lock_state();
            state.image_field = field;
            state.image_order = order;
            for section in &mut state.sections {
                section.sort(field, order);
            }
        }
        self.shared.events.publish(ModelEvent::Reset);
    }

    pub fn sort_sections(&self, field: SortField, order: SortOrder) {
        self.shared.events.publish(ModelEvent::AboutToReset);
        {
            let mut state = self.shared.lock_state();
            state.section_order = order;
            if state.section_field != field {
                // regrouping: take everything out and rebucket
                state.section_field = field;
                let entries: Vec<ModelEntry> = state
                    .sections
                    .drain(..)
                    .flat_map(|s| s.entries)
                    .collect();
                for entry in entries {
                    let key = section_key(&entry.image, field);
                    let pos = match state.sections.iter().position(|s| s.key == key) {
                        Some(pos) => pos,
                        None => {
                            let pos = state.sections.partition_point(|s| {
                                cmp_sections(&s.key, &key, order) != std::cmp::Ordering::Greater
                            });
                            state.sections.insert(pos, SectionItem::new(key));
                            pos
                        }
                    };
                    state.sections[pos].entries.push(entry);
                }
                let (ifield, iorder) = (state.image_field, state.image_order);
                for section in &mut state.sections {
                    section.sort(ifield, iorder);
                }
            } else {
                state
                    .sections
                    .sort_by(|a, b| cmp_sections(&a.key, &b.key, order));
            }
        }
        self.shared.events.publish(ModelEvent::Reset);
    }

    pub fn row(&self, index: usize) -> Option<Row> {
        self.shared.lock_state().row(index)
    }

    pub fn index_of_image(&self, id: ImageId) -> Option<usize> {
        self.shared.lock_state().flat_index_of(id)
    }

    pub fn image_at(&self, index: usize) -> Option<Arc<Image>> {
        match self.row(index)? {
            Row::Image(entry) => Some(entry.image),
            Row::Section(_) => None,
        }
    }

    pub fn row_data(&self, index: usize) -> Option<RowData> {
        let row = self.row(index)?;
        let flags = self.view_flags();
        match row {
            Row::Section(key) => Some(RowData {
                display_name: key.display_name(),
                tooltip: String::new(),
                decoration: Decoration::None,
                check_state: CheckState::Unchecked,
                is_section: true,
                enabled: false,
            }),
            Row::Image(entry) => {
                let image = &entry.image;
                let task = {
                    let state = self.shared.lock_state();
                    state.tasks.get(&image.id()).cloned()
                };
                let in_flight = task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);

                let decoration = if in_flight {
                    let percent = task.map(|t| t.progress().0).unwrap_or(0);
                    Decoration::Spinner { percent }
                } else if let Some(thumb) = image.thumbnail_transformed(self.icon_height()) {
                    Decoration::Thumbnail(thumb)
                } else if let Some(icon) = image.file_type_icon() {
                    Decoration::FileTypeIcon(icon)
                } else {
                    Decoration::None
                };

                let tooltip = match image.decoding_state() {
                    DecodingState::Error | DecodingState::Fatal => {
                        image.error_message().unwrap_or_default()
                    }
                    _ if in_flight => "Decoding not yet started".to_string(),
                    _ => image.format_info_string(),
                };

                Some(RowData {
                    display_name: image.file_name(),
                    tooltip,
                    decoration,
                    check_state: image.check_state(),
                    is_section: false,
                    enabled: !image.hide_if_non_raw_available(flags),
                })
            }
        }
    }

    /// External flag-relevant changes (sibling pairing flips during a
    /// reconcile) surface as a row-level data change.
    pub fn notify_image_flags_changed(&self, id: ImageId) {
        self.shared.data_changed(id, &[RowRole::Flags]);
    }

    pub fn set_check_state(&self, image: &Arc<Image>, check: CheckState) {
        {
            let mut state = self.shared.lock_state();
            match check {
                CheckState::Unchecked => {
                    state.checked.remove(&image.id());
                }
                _ => {
                    state.checked.insert(image.id());
                }
            }
        }
        image.set_check_state(check);
    }

    pub fn checked_images(&self) -> Vec<ImageId> {
        let state = self.shared.lock_state();
        let mut ids: Vec<ImageId> = state.checked.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Changing directory while anything is checked needs an explicit
    /// user confirmation; the UI gates on this.
    pub fn is_safe_to_change_dir(&self) -> bool {
        self.shared.lock_state().checked.is_empty()
    }

    /// Schedules a background decode for every entry with a decoder,
    /// skipping preview requests that already have a thumbnail. Surfaces
    /// are released as each task finishes; only the derived thumbnails
    /// stay.
    pub fn decode_all_images(&self, pool: &DecodePool, target: DecodingState, icon_height: u32) {
        let entries: Vec<ModelEntry> = {
            let state = self.shared.lock_state();
            state
                .sections
                .iter()
                .flat_map(|s| s.entries.iter().cloned())
                .collect()
        };
        for entry in entries {
            let Some(decoder) = entry.decoder.clone() else {
                continue;
            };
            if target == DecodingState::PreviewImage && entry.image.thumbnail().is_some() {
                continue;
            }
            let desired = entry
                .image
                .size()
                .filter(Size::is_valid)
                .map(|full| {
                    let w = (u64::from(full.width) * u64::from(icon_height)
                        / u64::from(full.height.max(1))) as u32;
                    Size::new(w.max(1), icon_height)
                })
                .unwrap_or(Size::new(icon_height, icon_height));
            let fut =
                decoder.decode_async(pool, target, Priority::Background, Some(desired), None);
            let image = entry.image.clone();
            fut.on_finished(move |_| image.release_surface());
            self.register_task(entry.image.id(), fut);
        }
    }

    /// Walks `steps` images from `from` in flat order, skipping section
    /// headers, backup files, entries without a decoder and raw files
    /// hidden by their developed sibling.
    pub fn go_to(&self, flags: ViewFlags, from: ImageId, steps: i64) -> Option<Arc<Image>> {
        if steps == 0 {
            return None;
        }
        let state = self.shared.lock_state();
        let start = state.flat_index_of(from)?;
        let count = state.row_count();
        let step: i64 = if steps < 0 { -1 } else { 1 };
        let mut remaining = steps;
        let mut idx = start as i64;
        let mut found = None;
        while remaining != 0 {
            idx += step;
            if idx < 0 || idx >= count as i64 {
                return None;
            }
            let Some(Row::Image(entry)) = state.row(idx as usize) else {
                continue;
            };
            let skip = entry.image.extension() == "bak"
                || !entry.image.has_decoder()
                || entry.image.hide_if_non_raw_available(flags);
            if !skip {
                remaining -= step;
                found = Some(entry.image);
            }
        }
        found
    }
}
