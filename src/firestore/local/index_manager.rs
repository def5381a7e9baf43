//! Client-side field indexes.
//!
//! Every index entry stores one order-preserving encoding per index segment.
//! Lookups translate a target's filters into byte intervals per segment, scan
//! the index by its first segment and check the remaining segments entry by
//! entry. Callers always re-apply the target's filters and ordering to the
//! documents they load, so the intervals only need to be a superset of the
//! matching entries.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::filter::{compute_dnf, FieldFilter, Filter, Operator};
use crate::firestore::core::query::{Direction, OrderBy};
use crate::firestore::core::target::Target;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{tables, IndexEntry, SchemaTables};
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexOffset, IndexSegment, IndexState, MutableDocument,
    ResourcePath, SegmentKind,
};
use crate::firestore::value::index_encoding::{
    encode_index_value, invert, lower_type_bound, upper_type_bound, IndexDirection,
};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No index serves the target.
    None,
    /// An index narrows the candidates but does not cover every filter and order.
    Partial,
    /// An index covers every filter and order of the target.
    Full,
}

/// Records that `collection_path` has at least one document, so collection
/// group queries know which parents to visit.
pub fn add_to_collection_parent_index(
    txn: &mut PersistenceTransaction<'_>,
    collection_path: &ResourcePath,
) -> FirestoreResult<()> {
    let Some(collection_id) = collection_path.last_segment() else {
        return Ok(());
    };
    let row = (collection_id.to_string(), collection_path.without_last());
    if txn.tables().collection_parents.contains_key(&row) {
        return Ok(());
    }
    txn.put(tables::collection_parents, row, ())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    pub fn new() -> Self {
        Self
    }

    pub fn add_to_collection_parent_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        add_to_collection_parent_index(txn, collection_path)
    }

    pub fn get_collection_parents(&self, txn: &PersistenceTransaction<'_>, collection_id: &str) -> Vec<ResourcePath> {
        txn.tables()
            .collection_parents
            .range((collection_id.to_string(), ResourcePath::root())..)
            .take_while(|((id, _), _)| id == collection_id)
            .map(|((_, parent), _)| parent.clone())
            .collect()
    }

    /// Stores a new index definition and returns it with its assigned id.
    /// Entries are written later by the backfiller.
    pub fn add_field_index(&self, txn: &mut PersistenceTransaction<'_>, index: FieldIndex) -> FirestoreResult<FieldIndex> {
        let index_id = txn
            .tables()
            .field_indexes
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(1);
        let index = FieldIndex {
            index_id,
            state: IndexState::default(),
            ..index
        };
        log::debug!(
            "adding field index {} on {} with {} segments",
            index_id,
            index.collection_group,
            index.segments.len()
        );
        txn.put(tables::field_indexes, index_id, index.clone())?;
        Ok(index)
    }

    pub fn delete_field_index(&self, txn: &mut PersistenceTransaction<'_>, index_id: i32) -> FirestoreResult<()> {
        txn.delete(tables::field_indexes, &index_id)?;
        let entries: Vec<(i32, Vec<u8>, DocumentKey)> = txn
            .tables()
            .index_entries
            .range((index_id, Vec::new(), DocumentKey::empty())..)
            .take_while(|((id, _, _), _)| *id == index_id)
            .map(|(row, _)| row.clone())
            .collect();
        for row in entries {
            txn.delete(tables::document_index_entries, &(row.2.clone(), index_id))?;
            txn.delete(tables::index_entries, &row)?;
        }
        Ok(())
    }

    /// Indexes of `collection_group`, or every index when `None`.
    pub fn get_field_indexes(&self, txn: &PersistenceTransaction<'_>, collection_group: Option<&str>) -> Vec<FieldIndex> {
        txn.tables()
            .field_indexes
            .values()
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .cloned()
            .collect()
    }

    /// The index serving the most segments of `target`, if any serves it.
    pub fn get_field_index(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> Option<FieldIndex> {
        let matcher = TargetIndexMatcher::new(target);
        let mut best: Option<FieldIndex> = None;
        for candidate in self.get_field_indexes(txn, Some(&matcher.collection_id)) {
            if !matcher.served_by_index(&candidate) {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |current| candidate.segments.len() > current.segments.len())
            {
                best = Some(candidate);
            }
        }
        best
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> IndexType {
        let sub_targets = sub_targets(target);
        let mut result = IndexType::Full;
        for sub_target in &sub_targets {
            let Some(index) = self.get_field_index(txn, sub_target) else {
                return IndexType::None;
            };
            if index.segments.len() < segment_count(sub_target) {
                result = IndexType::Partial;
            }
        }
        // A limit cannot be pushed into a union of several index scans.
        if target.limit.is_some() && sub_targets.len() > 1 && result == IndexType::Full {
            return IndexType::Partial;
        }
        result
    }

    /// Keys of indexed documents that may match `target`, or `None` when some
    /// part of the target has no usable index.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> Option<Vec<DocumentKey>> {
        let mut plans = Vec::new();
        for sub_target in sub_targets(target) {
            let index = self.get_field_index(txn, &sub_target)?;
            plans.push(ScanPlan::new(&sub_target, index));
        }
        let mut keys = BTreeSet::new();
        for plan in &plans {
            keys.extend(plan.scan(txn.tables()));
        }
        log::debug!(
            "index scan for {} produced {} candidates",
            target.canonical_id(),
            keys.len()
        );
        Some(keys.into_iter().collect())
    }

    /// Smallest offset among the indexes serving `target`.
    pub fn get_min_offset(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> IndexOffset {
        sub_targets(target)
            .iter()
            .filter_map(|sub_target| self.get_field_index(txn, sub_target))
            .map(|index| index.state.offset)
            .min()
            .unwrap_or_else(IndexOffset::none)
    }

    pub fn get_min_offset_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
    ) -> IndexOffset {
        self.get_field_indexes(txn, Some(collection_group))
            .into_iter()
            .map(|index| index.state.offset)
            .min()
            .unwrap_or_else(IndexOffset::none)
    }

    /// Collection group whose indexes were backfilled least recently.
    pub fn get_next_collection_group_to_update(&self, txn: &PersistenceTransaction<'_>) -> Option<String> {
        txn.tables()
            .field_indexes
            .values()
            .min_by_key(|index| (index.state.sequence_number, index.index_id))
            .map(|index| index.collection_group.clone())
    }

    /// Marks every index of `collection_group` as complete up to `offset`.
    pub fn update_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: IndexOffset,
    ) -> FirestoreResult<()> {
        let next_sequence_number = txn
            .tables()
            .field_indexes
            .values()
            .map(|index| index.state.sequence_number)
            .max()
            .unwrap_or(0)
            + 1;
        for mut index in self.get_field_indexes(txn, Some(collection_group)) {
            index.state = IndexState {
                sequence_number: next_sequence_number,
                offset: offset.clone(),
            };
            txn.put(tables::field_indexes, index.index_id, index)?;
        }
        Ok(())
    }

    /// Rewrites the entries of every index covering each document.
    pub fn update_index_entries(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<()> {
        for (key, document) in documents {
            for index in self.get_field_indexes(txn, Some(key.collection_group())) {
                let desired = if document.is_found_document() {
                    compute_index_entries(&index, document)
                } else {
                    BTreeMap::new()
                };
                let existing = txn
                    .tables()
                    .document_index_entries
                    .get(&(key.clone(), index.index_id))
                    .cloned()
                    .unwrap_or_default();
                for encoded in &existing {
                    if !desired.contains_key(encoded) {
                        txn.delete(
                            tables::index_entries,
                            &(index.index_id, encoded.clone(), key.clone()),
                        )?;
                    }
                }
                for (encoded, segment_values) in &desired {
                    if !existing.contains(encoded) {
                        txn.put(
                            tables::index_entries,
                            (index.index_id, encoded.clone(), key.clone()),
                            IndexEntry {
                                segment_values: segment_values.clone(),
                            },
                        )?;
                    }
                }
                if desired.is_empty() {
                    txn.delete(tables::document_index_entries, &(key.clone(), index.index_id))?;
                } else {
                    txn.put(
                        tables::document_index_entries,
                        (key.clone(), index.index_id),
                        desired.keys().cloned().collect(),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Adds an index for every part of `target` that no index fully serves.
    pub fn create_target_indexes(&self, txn: &mut PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<()> {
        for sub_target in sub_targets(target) {
            if self.get_index_type(txn, &sub_target) == IndexType::Full {
                continue;
            }
            let candidate = TargetIndexMatcher::new(&sub_target).build_target_index();
            if candidate.segments.is_empty() {
                continue;
            }
            let exists = txn
                .tables()
                .field_indexes
                .values()
                .any(|index| index.same_definition(&candidate));
            if !exists {
                self.add_field_index(txn, candidate)?;
            }
        }
        Ok(())
    }
}

/// Splits a target into AND-only targets, one per disjunct of its filters.
pub(crate) fn sub_targets(target: &Target) -> Vec<Target> {
    if target.filters.is_empty() {
        return vec![target.clone()];
    }
    compute_dnf(&Filter::and(target.filters.clone()))
        .into_iter()
        .map(|term| Target {
            filters: term.into_iter().map(Filter::Field).collect(),
            ..target.clone()
        })
        .collect()
}

/// Number of index segments needed to fully serve `target`.
fn segment_count(target: &Target) -> usize {
    let mut fields = BTreeSet::new();
    let mut has_array_segment = false;
    for filter in target.field_filters() {
        if filter.field.is_key_field() {
            continue;
        }
        if filter.op.is_array_operator() {
            has_array_segment = true;
        } else {
            fields.insert(filter.field.clone());
        }
    }
    for order in &target.order_by {
        if !order.field.is_key_field() {
            fields.insert(order.field.clone());
        }
    }
    fields.len() + usize::from(has_array_segment)
}

/// Encodings a document contributes to `index`, keyed by their concatenation.
fn compute_index_entries(index: &FieldIndex, document: &MutableDocument) -> BTreeMap<Vec<u8>, Vec<Vec<u8>>> {
    let mut prefixes: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
    for segment in &index.segments {
        let Some(value) = document.field(&segment.field_path) else {
            return BTreeMap::new();
        };
        let encodings: BTreeSet<Vec<u8>> = match segment.kind {
            SegmentKind::Contains => match value.as_array() {
                Some(array) => array
                    .values()
                    .iter()
                    .map(|element| encode_index_value(element, IndexDirection::Ascending))
                    .collect(),
                None => return BTreeMap::new(),
            },
            kind => BTreeSet::from([encode_index_value(value, kind.direction())]),
        };
        prefixes = prefixes
            .into_iter()
            .flat_map(|prefix| {
                encodings.iter().map(move |encoded| {
                    let mut next = prefix.clone();
                    next.push(encoded.clone());
                    next
                })
            })
            .collect();
    }
    prefixes
        .into_iter()
        .map(|segments| (segments.concat(), segments))
        .collect()
}

/// Decides whether an index can serve a target and derives one that would.
struct TargetIndexMatcher {
    collection_id: String,
    inequality_filters: Vec<FieldFilter>,
    equality_filters: Vec<FieldFilter>,
    order_bys: Vec<OrderBy>,
}

impl TargetIndexMatcher {
    fn new(target: &Target) -> Self {
        let collection_id = target
            .collection_group
            .clone()
            .or_else(|| target.path.last_segment().map(str::to_string))
            .unwrap_or_default();
        let mut inequality_filters = Vec::new();
        let mut equality_filters = Vec::new();
        for filter in target.field_filters() {
            if filter.op.is_inequality() {
                inequality_filters.push(filter.clone());
            } else {
                equality_filters.push(filter.clone());
            }
        }
        Self {
            collection_id,
            inequality_filters,
            equality_filters,
            order_bys: target.order_by.clone(),
        }
    }

    fn has_multiple_inequality(&self) -> bool {
        let fields: BTreeSet<&FieldPath> = self.inequality_filters.iter().map(|f| &f.field).collect();
        fields.len() > 1
    }

    fn served_by_index(&self, index: &FieldIndex) -> bool {
        if index.collection_group != self.collection_id || self.has_multiple_inequality() {
            return false;
        }
        if let Some(array_segment) = index.array_segment() {
            if !self.has_matching_equality_filter(array_segment) {
                return false;
            }
        }

        let segments: Vec<&IndexSegment> = index.directional_segments().collect();
        let mut segment_index = 0;
        let mut equality_fields = BTreeSet::new();
        while segment_index < segments.len() && self.has_matching_equality_filter(segments[segment_index]) {
            equality_fields.insert(segments[segment_index].field_path.clone());
            segment_index += 1;
        }
        if segment_index == segments.len() {
            return true;
        }

        let mut order_by_index = 0;
        if let Some(inequality) = self.inequality_filters.first() {
            if !equality_fields.contains(&inequality.field) {
                let segment = segments[segment_index];
                let ordered = self
                    .order_bys
                    .get(order_by_index)
                    .is_some_and(|order| matches_order_by(order, segment));
                order_by_index += 1;
                if !matches_filter(inequality, segment) || !ordered {
                    return false;
                }
            }
            segment_index += 1;
        }

        for segment in &segments[segment_index.min(segments.len())..] {
            let Some(order) = self.order_bys.get(order_by_index) else {
                return false;
            };
            order_by_index += 1;
            if !matches_order_by(order, segment) {
                return false;
            }
        }
        true
    }

    fn has_matching_equality_filter(&self, segment: &IndexSegment) -> bool {
        self.equality_filters
            .iter()
            .any(|filter| matches_filter(filter, segment))
    }

    fn build_target_index(&self) -> FieldIndex {
        let mut unique_fields = BTreeSet::new();
        let mut segments = Vec::new();
        for filter in &self.equality_filters {
            if filter.field.is_key_field() {
                continue;
            }
            if filter.op.is_array_operator() {
                segments.push(IndexSegment::new(filter.field.clone(), SegmentKind::Contains));
            } else if unique_fields.insert(filter.field.clone()) {
                segments.push(IndexSegment::new(filter.field.clone(), SegmentKind::Ascending));
            }
        }
        for order in &self.order_bys {
            if order.field.is_key_field() || !unique_fields.insert(order.field.clone()) {
                continue;
            }
            let kind = match order.direction {
                Direction::Ascending => SegmentKind::Ascending,
                Direction::Descending => SegmentKind::Descending,
            };
            segments.push(IndexSegment::new(order.field.clone(), kind));
        }
        FieldIndex::new(self.collection_id.clone(), segments)
    }
}

fn matches_filter(filter: &FieldFilter, segment: &IndexSegment) -> bool {
    filter.field == segment.field_path
        && filter.op.is_array_operator() == (segment.kind == SegmentKind::Contains)
}

fn matches_order_by(order: &OrderBy, segment: &IndexSegment) -> bool {
    order.field == segment.field_path
        && matches!(
            (order.direction, segment.kind),
            (Direction::Ascending, SegmentKind::Ascending) | (Direction::Descending, SegmentKind::Descending)
        )
}

/// One end of a byte interval; `None` is unbounded.
type Endpoint = Option<(Vec<u8>, bool)>;

/// Interval of ascending encodings.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ByteRange {
    lower: Endpoint,
    upper: Endpoint,
}

impl ByteRange {
    fn full() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    fn point(encoded: Vec<u8>) -> Self {
        Self {
            lower: Some((encoded.clone(), true)),
            upper: Some((encoded, true)),
        }
    }

    fn new(lower: Endpoint, upper: Endpoint) -> Self {
        Self { lower, upper }
    }

    fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some((lower, lower_inclusive)), Some((upper, upper_inclusive))) => match lower.cmp(upper) {
                Ordering::Greater => true,
                Ordering::Equal => !(*lower_inclusive && *upper_inclusive),
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    fn intersect(&self, other: &ByteRange) -> ByteRange {
        let lower = match (&self.lower, &other.lower) {
            (None, bound) | (bound, None) => bound.clone(),
            (Some(a), Some(b)) => Some(match a.0.cmp(&b.0) {
                Ordering::Greater => a.clone(),
                Ordering::Less => b.clone(),
                Ordering::Equal => (a.0.clone(), a.1 && b.1),
            }),
        };
        let upper = match (&self.upper, &other.upper) {
            (None, bound) | (bound, None) => bound.clone(),
            (Some(a), Some(b)) => Some(match a.0.cmp(&b.0) {
                Ordering::Less => a.clone(),
                Ordering::Greater => b.clone(),
                Ordering::Equal => (a.0.clone(), a.1 && b.1),
            }),
        };
        ByteRange { lower, upper }
    }

    fn contains(&self, encoded: &[u8]) -> bool {
        let above_lower = match &self.lower {
            None => true,
            Some((lower, inclusive)) => match encoded.cmp(lower.as_slice()) {
                Ordering::Greater => true,
                Ordering::Equal => *inclusive,
                Ordering::Less => false,
            },
        };
        let below_upper = match &self.upper {
            None => true,
            Some((upper, inclusive)) => match encoded.cmp(upper.as_slice()) {
                Ordering::Less => true,
                Ordering::Equal => *inclusive,
                Ordering::Greater => false,
            },
        };
        above_lower && below_upper
    }
}

fn intersect_ranges(left: &[ByteRange], right: &[ByteRange]) -> Vec<ByteRange> {
    let mut result = Vec::new();
    for a in left {
        for b in right {
            let range = a.intersect(b);
            if !range.is_empty() && !result.contains(&range) {
                result.push(range);
            }
        }
    }
    result
}

fn asc(value: &FirestoreValue) -> Vec<u8> {
    encode_index_value(value, IndexDirection::Ascending)
}

/// Ascending byte ranges a non-array filter allows for its field.
fn filter_ranges(filter: &FieldFilter) -> Vec<ByteRange> {
    let value = &filter.value;
    match filter.op {
        Operator::Equal => vec![ByteRange::point(asc(value))],
        Operator::In => value
            .as_array()
            .map(|array| array.values().iter().map(|v| ByteRange::point(asc(v))).collect())
            .unwrap_or_default(),
        Operator::LessThan => vec![ByteRange::new(
            Some((lower_type_bound(value), true)),
            Some((asc(value), false)),
        )],
        Operator::LessThanOrEqual => vec![ByteRange::new(
            Some((lower_type_bound(value), true)),
            Some((asc(value), true)),
        )],
        Operator::GreaterThan => vec![ByteRange::new(
            Some((asc(value), false)),
            Some((upper_type_bound(value), false)),
        )],
        Operator::GreaterThanOrEqual => vec![ByteRange::new(
            Some((asc(value), true)),
            Some((upper_type_bound(value), false)),
        )],
        Operator::NotEqual => vec![
            ByteRange::new(None, Some((asc(value), false))),
            ByteRange::new(Some((asc(value), false)), None),
        ],
        // Excluded values are removed when the documents are re-filtered.
        Operator::NotIn | Operator::ArrayContains | Operator::ArrayContainsAny => vec![ByteRange::full()],
    }
}

/// Byte ranges per index segment for one AND-only target.
struct ScanPlan {
    index: FieldIndex,
    /// Ascending ranges, one list per segment in index order.
    ranges: Vec<Vec<ByteRange>>,
}

impl ScanPlan {
    fn new(target: &Target, index: FieldIndex) -> Self {
        let first_order = target.order_by.first();
        let ranges = index
            .segments
            .iter()
            .map(|segment| {
                let filters = target
                    .field_filters()
                    .into_iter()
                    .filter(|filter| filter.field == segment.field_path);
                let mut ranges = vec![ByteRange::full()];
                if segment.kind == SegmentKind::Contains {
                    for filter in filters.filter(|filter| filter.op.is_array_operator()) {
                        let points: Vec<ByteRange> = match filter.op {
                            Operator::ArrayContains => vec![ByteRange::point(asc(&filter.value))],
                            _ => filter
                                .value
                                .as_array()
                                .map(|array| array.values().iter().map(|v| ByteRange::point(asc(v))).collect())
                                .unwrap_or_default(),
                        };
                        ranges = intersect_ranges(&ranges, &points);
                    }
                    return ranges;
                }
                for filter in filters.filter(|filter| !filter.op.is_array_operator()) {
                    ranges = intersect_ranges(&ranges, &filter_ranges(filter));
                }
                if let Some(order) = first_order.filter(|order| order.field == segment.field_path) {
                    ranges = intersect_ranges(&ranges, &cursor_ranges(target, order));
                }
                ranges
            })
            .collect();
        Self { index, ranges }
    }

    fn segment_matches(&self, position: usize, stored: &[u8]) -> bool {
        let Some(ranges) = self.ranges.get(position) else {
            return false;
        };
        let descending = self
            .index
            .segments
            .get(position)
            .is_some_and(|segment| segment.kind == SegmentKind::Descending);
        let ascending;
        let encoded = if descending {
            let mut bytes = stored.to_vec();
            invert(&mut bytes);
            ascending = bytes;
            ascending.as_slice()
        } else {
            stored
        };
        ranges.iter().any(|range| range.contains(encoded))
    }

    fn scan(&self, tables: &SchemaTables) -> Vec<DocumentKey> {
        let index_id = self.index.index_id;
        if self.ranges.iter().any(Vec::is_empty) {
            return Vec::new();
        }
        // Ascending first segments narrow the scan; descending ones scan the
        // whole index since inverted type bounds do not bracket their values.
        let first_ascending = self
            .index
            .segments
            .first()
            .is_some_and(|segment| segment.kind != SegmentKind::Descending);
        let (start, stop) = match self.ranges.first() {
            Some(ranges) if first_ascending => {
                let start = ranges
                    .iter()
                    .map(|range| range.lower.as_ref().map(|(bytes, _)| bytes.clone()))
                    .min()
                    .flatten()
                    .unwrap_or_default();
                let stop = ranges
                    .iter()
                    .map(|range| range.upper.as_ref().map(|(bytes, _)| bytes.clone()))
                    .try_fold(Vec::new(), |max, upper| upper.map(|upper| max.max(upper)));
                (start, stop)
            }
            _ => (Vec::new(), None),
        };

        let mut keys = Vec::new();
        for ((id, _, key), entry) in tables.index_entries.range((index_id, start, DocumentKey::empty())..) {
            if *id != index_id {
                break;
            }
            let first = entry.segment_values.first().map(Vec::as_slice).unwrap_or_default();
            if let Some(stop) = &stop {
                if first > stop.as_slice() {
                    break;
                }
            }
            let all_match = entry
                .segment_values
                .iter()
                .enumerate()
                .all(|(position, stored)| self.segment_matches(position, stored));
            if all_match {
                keys.push(key.clone());
            }
        }
        keys
    }
}

/// Ranges implied by the target's cursors on its first order-by field.
/// Inclusive on both ends; later order-by fields may still exclude the edge.
fn cursor_ranges(target: &Target, order: &OrderBy) -> Vec<ByteRange> {
    let mut range = ByteRange::full();
    let ascending = order.direction == Direction::Ascending;
    if let Some(value) = target.start_at.as_ref().and_then(|bound| bound.position.first()) {
        let endpoint = Some((asc(value), true));
        let bound = if ascending {
            ByteRange::new(endpoint, None)
        } else {
            ByteRange::new(None, endpoint)
        };
        range = range.intersect(&bound);
    }
    if let Some(value) = target.end_at.as_ref().and_then(|bound| bound.position.first()) {
        let endpoint = Some((asc(value), true));
        let bound = if ascending {
            ByteRange::new(None, endpoint)
        } else {
            ByteRange::new(endpoint, None)
        };
        range = range.intersect(&bound);
    }
    vec![range]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{Bound, Query};
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::Timestamp;
    use crate::firestore::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap()
    }

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&field(name), value.clone());
        }
        MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), Timestamp::new(1, 0), data)
    }

    fn index_documents(txn: &mut PersistenceTransaction<'_>, manager: &IndexManager, docs: Vec<MutableDocument>) {
        let documents = docs.into_iter().map(|d| (d.key().clone(), d)).collect();
        manager.update_index_entries(txn, &documents).unwrap();
    }

    fn matching(manager: &IndexManager, txn: &PersistenceTransaction<'_>, query: &Query) -> Vec<String> {
        manager
            .get_documents_matching_target(txn, &query.to_target())
            .unwrap()
            .iter()
            .map(|key| key.id().to_string())
            .collect()
    }

    #[test]
    fn range_and_in_filters_use_the_index() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let manager = IndexManager::new();
        persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                manager.add_field_index(txn, FieldIndex::new("rooms", vec![IndexSegment::new(field("size"), SegmentKind::Ascending)]))?;
                index_documents(
                    txn,
                    &manager,
                    vec![
                        doc("rooms/a", &[("size", FirestoreValue::from_integer(1))]),
                        doc("rooms/b", &[("size", FirestoreValue::from_integer(5))]),
                        doc("rooms/c", &[("size", FirestoreValue::from_double(9.5))]),
                        doc("rooms/d", &[("size", FirestoreValue::from_string("big"))]),
                        doc("rooms/e", &[]),
                    ],
                );

                let greater = rooms().with_filter(Filter::field(field("size"), Operator::GreaterThan, FirestoreValue::from_integer(1)));
                assert_eq!(manager.get_index_type(txn, &greater.to_target()), IndexType::Full);
                assert_eq!(matching(&manager, txn, &greater), vec!["b", "c"]);

                let within = rooms().with_filter(Filter::field(
                    field("size"),
                    Operator::In,
                    FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), FirestoreValue::from_string("big")]),
                ));
                assert_eq!(matching(&manager, txn, &within), vec!["a", "d"]);

                let not_equal = rooms().with_filter(Filter::field(field("size"), Operator::NotEqual, FirestoreValue::from_integer(5)));
                assert_eq!(matching(&manager, txn, &not_equal), vec!["a", "c", "d"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn descending_and_array_segments() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let manager = IndexManager::new();
        persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                manager.add_field_index(
                    txn,
                    FieldIndex::new(
                        "rooms",
                        vec![
                            IndexSegment::new(field("tags"), SegmentKind::Contains),
                            IndexSegment::new(field("size"), SegmentKind::Descending),
                        ],
                    ),
                )?;
                let tags = |values: &[&str]| {
                    FirestoreValue::from_array(values.iter().map(|v| FirestoreValue::from_string(*v)).collect())
                };
                index_documents(
                    txn,
                    &manager,
                    vec![
                        doc("rooms/a", &[("tags", tags(&["x", "y"])), ("size", FirestoreValue::from_integer(1))]),
                        doc("rooms/b", &[("tags", tags(&["y"])), ("size", FirestoreValue::from_integer(7))]),
                        doc("rooms/c", &[("tags", tags(&["z"])), ("size", FirestoreValue::from_integer(3))]),
                    ],
                );
                let query = rooms()
                    .with_filter(Filter::field(field("tags"), Operator::ArrayContains, FirestoreValue::from_string("y")))
                    .with_order_by(OrderBy::new(field("size"), Direction::Descending))
                    .with_start_at(Bound::new(vec![FirestoreValue::from_integer(5)], true));
                assert_eq!(manager.get_index_type(txn, &query.to_target()), IndexType::Full);
                assert_eq!(matching(&manager, txn, &query), vec!["a"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn missing_index_is_reported_and_created() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let manager = IndexManager::new();
        persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                let query = rooms()
                    .with_filter(Filter::field(field("open"), Operator::Equal, FirestoreValue::from_bool(true)))
                    .with_order_by(OrderBy::new(field("size"), Direction::Ascending));
                let target = query.to_target();
                assert_eq!(manager.get_index_type(txn, &target), IndexType::None);
                assert!(manager.get_documents_matching_target(txn, &target).is_none());
                manager.create_target_indexes(txn, &target)?;
                assert_eq!(manager.get_index_type(txn, &target), IndexType::Full);
                manager.create_target_indexes(txn, &target)?;
                assert_eq!(manager.get_field_indexes(txn, Some("rooms")).len(), 1);
                assert_eq!(manager.get_next_collection_group_to_update(txn).as_deref(), Some("rooms"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn entries_follow_document_updates() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let manager = IndexManager::new();
        persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                manager.add_field_index(txn, FieldIndex::new("rooms", vec![IndexSegment::new(field("size"), SegmentKind::Ascending)]))?;
                index_documents(txn, &manager, vec![doc("rooms/a", &[("size", FirestoreValue::from_integer(1))])]);
                index_documents(txn, &manager, vec![doc("rooms/a", &[("size", FirestoreValue::from_integer(2))])]);
                assert_eq!(txn.tables().index_entries.len(), 1);
                let deleted = MutableDocument::new_no_document(DocumentKey::from_string("rooms/a").unwrap(), Timestamp::new(2, 0));
                index_documents(txn, &manager, vec![deleted]);
                assert!(txn.tables().index_entries.is_empty());
                assert!(txn.tables().document_index_entries.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
