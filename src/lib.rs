//! Tagged DFA construction and skeleton self-test generation.
//!
//! This crate implements the two algorithmic kernels at the core of a
//! lexer generator: the *tagged ε-closure* that powers subset
//! construction (NFA → DFA while tracking submatch capture positions),
//! and the *skeleton path enumerator* that derives a self-test input
//! corpus from the finished DFA.
//!
//! # Architecture
//!
//! The pipeline is:
//!
//! ```text
//! regex_syntax::hir::Hir ──NfaBuilder──> tagged NFA
//!     ──determinize──> Dfa (+ TagPool, TcPool, badtags, shadow sets)
//!     ──Skeleton──> size estimate ──> path corpus ──> C data file
//! ```
//!
//! ## Tagged ε-closure
//!
//! A DFA state is a set of NFA *kernel* states (states that consume a
//! character or accept), each paired with tag information.  Purely
//! ε-transitioning states (`Nil`, `Alt`, `Tag`) are consumed while the
//! closure is built and never appear in it.
//!
//! Every ε-path to a kernel state accumulates tag writes along the way
//! (`cursor` = "record the current input position", `bottom` = "record
//! ⊥, the tag did not fire").  When two ε-paths reach the same kernel
//! state with different tag sets, the NFA is tag-wise ambiguous; the
//! closure keeps the higher-priority configuration, and the conflict
//! surfaces through `badtags` once the competing paths separate into
//! distinct kernel states of the same rule.
//!
//! ε-cycles require care: a plain visited check would hide conflicts
//! that only appear the second time around a loop (a tag inside the
//! loop body observed both "before" and "after" an iteration).  Each
//! NFA state therefore carries a small `loops` counter and may be
//! entered while `loops <= 1` — tracing the first iteration of every
//! ε-loop is enough to expose any tag conflict, and the bound keeps
//! the traversal finite.
//!
//! Configuration priority is a lexicographic order over tags, iterated
//! from the *highest* tag index down (higher-indexed tags have lower
//! priority), comparing lookahead tags, then transition tags, then
//! pre-transition versions.  Smaller values win: smaller versions were
//! assigned earlier, which encodes the "earliest match, leftmost
//! capture" disambiguation.
//!
//! ## Determinization
//!
//! The subset-construction driver walks a worklist of DFA states.  For
//! each input symbol it collects the *reach set* — the successors of
//! the closure items whose ranges cover the symbol — and hands it to
//! the closure kernel.  The lookahead tags gathered by the previous
//! closure become the transition tags of the next one; the kernel
//! merges them into fresh tag versions and one tag-commit record per
//! transition.  Symbols with identical reach sets share a single
//! kernel call, and the resulting closures are keyed by a canonical
//! kernel (versions renumbered densely in first-use order) so that
//! tagged loops reach a fixed point instead of allocating forever.
//!
//! ## Skeleton
//!
//! The skeleton mirrors the DFA with one node per state plus a sink
//! node standing in for the missing transition.  Each edge keeps at
//! most two representative characters per original span (the lower
//! bound, and the upper bound when the span is wider than one).  Two
//! enumeration modes produce the corpus:
//!
//! - **exhaustive** — every path, used when the estimated corpus stays
//!   under [`MAX_SIZE`];
//! - **cover** — every edge at least once.  Inbound prefixes are dealt
//!   round-robin across outbound edges by a wrapping iterator that
//!   keeps cycling after the last real edge until every prefix has
//!   been dispatched, which keeps the corpus linear in the number of
//!   edges.  Each node lazily caches a terminating suffix (`path`) so
//!   paths can be closed without re-walking the graph.
//!
//! Both estimators bound recursion over cyclic DFAs with a per-node
//! `visited` counter, mirroring the `loops` bound of the closure.  The
//! corpus is serialised as one concatenated array plus a table of
//! `(endpos, startpos, rule)` triples the generated test driver checks
//! itself against.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::{self, Write};
use std::ops::{Index, IndexMut};

use indexmap::{IndexMap, IndexSet};
use regex_syntax::hir::{self, Hir, HirKind};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// An error returned when a rule's HIR contains constructs we don't
/// support.
#[derive(Debug)]
pub enum Error {
    /// A character class that cannot be lowered to single code units
    /// (i.e. contains codepoints above U+00FF).
    UnsupportedClass(hir::Class),
    /// A look-around assertion.  Lexer rules match at the cursor, so
    /// anchors and word boundaries have no meaning here.
    UnsupportedLook(hir::Look),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedClass(class) => {
                write!(f, "unsupported character class: {:?}", class)
            }
            Self::UnsupportedLook(look) => {
                write!(f, "unsupported look-around assertion: {:?}", look)
            }
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Tag versions
// ---------------------------------------------------------------------------

/// A tag version: a storage-slot identifier for one observation of a
/// submatch position.
///
/// Ordinary versions are positive (cursor-origin) or negative
/// (bottom-origin); their absolute values are globally unique within
/// one generator run.  The extremes of the value space are reserved as
/// markers so that the signed order `BOTTOM < versions < CURSOR` can be
/// used directly when comparing configurations.
pub type TagVer = i32;

/// No version: the tag passes through unchanged.
pub const TAGVER_ZERO: TagVer = 0;
/// Marker: this transition writes the current input position.
pub const TAGVER_CURSOR: TagVer = TagVer::MAX;
/// Marker: this transition writes ⊥ ("the tag did not fire").
pub const TAGVER_BOTTOM: TagVer = TagVer::MIN;

/// Handle to an interned tag vector in a [`TagPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagsId(pub u32);

/// The all-[`TAGVER_ZERO`] vector, interned at pool construction.
pub const ZERO_TAGS: TagsId = TagsId(0);

impl TagsId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// TagPool
// ---------------------------------------------------------------------------

/// Hash-consed pool of tag-version vectors.
///
/// All tag vectors have length `ntags`; value-equal vectors are stored
/// once and referenced by [`TagsId`] handles, so handle equality is
/// vector equality.  The pool also owns three scratch buffers of
/// length `ntags` used for in-place tag computations inside the
/// closure kernel; they are taken with `mem::take` for the duration of
/// one kernel call and restored before it returns, never retained
/// across calls.
#[derive(Debug)]
pub struct TagPool {
    ntags: usize,
    vecs: IndexSet<Box<[TagVer]>>,
    buffer1: Vec<TagVer>,
    buffer2: Vec<TagVer>,
    buffer3: Vec<TagVer>,
}

impl TagPool {
    pub fn new(ntags: usize) -> Self {
        let mut vecs = IndexSet::new();
        vecs.insert(vec![TAGVER_ZERO; ntags].into_boxed_slice());
        TagPool {
            ntags,
            vecs,
            buffer1: vec![TAGVER_ZERO; ntags],
            buffer2: vec![TAGVER_ZERO; ntags],
            buffer3: vec![TAGVER_ZERO; ntags],
        }
    }

    #[inline]
    pub fn ntags(&self) -> usize {
        self.ntags
    }

    /// Intern `tags`.  Equal inputs return equal handles; the insert is
    /// allocation-free when the vector is already present.
    pub fn insert(&mut self, tags: &[TagVer]) -> TagsId {
        debug_assert_eq!(tags.len(), self.ntags);
        if let Some(idx) = self.vecs.get_index_of(tags) {
            return TagsId(idx as u32);
        }
        let (idx, _) = self.vecs.insert_full(tags.to_vec().into_boxed_slice());
        TagsId(idx as u32)
    }
}

/// `tagpool[id]` — read-only view of an interned tag vector.
impl Index<TagsId> for TagPool {
    type Output = [TagVer];

    #[inline]
    fn index(&self, idx: TagsId) -> &[TagVer] {
        match self.vecs.get_index(idx.idx()) {
            Some(v) => v,
            None => panic!("dangling tag-vector handle {}", idx.0),
        }
    }
}

// ---------------------------------------------------------------------------
// TcPool (tag-commit records)
// ---------------------------------------------------------------------------

/// Handle to an interned tag-commit record in a [`TcPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TcId(pub u32);

/// The empty tag-commit record (no writes), interned at pool
/// construction.
pub const TC_NONE: TcId = TcId(0);

impl TcId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A single tag-slot write performed when a transition is taken: store
/// the current input position (or ⊥ when `bottom`) into slot `slot`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SaveCmd {
    pub slot: u32,
    pub bottom: bool,
}

/// Pool of tag-commit records — the "save" instruction sequences
/// emitted on DFA transitions.
#[derive(Debug)]
pub struct TcPool {
    saves: IndexSet<Box<[SaveCmd]>>,
}

impl TcPool {
    pub fn new() -> Self {
        let mut saves = IndexSet::new();
        saves.insert(Vec::new().into_boxed_slice());
        TcPool { saves }
    }

    /// Lower the per-tag version buffers produced by transition-tag
    /// merging into a save record: one cursor write per tag with
    /// `cur[t] != 0`, one ⊥ write per tag with `bot[t] != 0`.
    pub fn conv_to_save(&mut self, bot: &[TagVer], cur: &[TagVer]) -> TcId {
        debug_assert_eq!(bot.len(), cur.len());
        let mut cmds = Vec::new();
        for t in 0..cur.len() {
            if cur[t] != TAGVER_ZERO {
                cmds.push(SaveCmd { slot: cur[t] as u32, bottom: false });
            }
            if bot[t] != TAGVER_ZERO {
                cmds.push(SaveCmd { slot: (-bot[t]) as u32, bottom: true });
            }
        }
        let (idx, _) = self.saves.insert_full(cmds.into_boxed_slice());
        TcId(idx as u32)
    }
}

impl Default for TcPool {
    fn default() -> Self {
        Self::new()
    }
}

/// `tcpool[id]` — the slot writes of an interned record.
impl Index<TcId> for TcPool {
    type Output = [SaveCmd];

    #[inline]
    fn index(&self, idx: TcId) -> &[SaveCmd] {
        match self.saves.get_index(idx.idx()) {
            Some(v) => v,
            None => panic!("dangling tag-commit handle {}", idx.0),
        }
    }
}

// ---------------------------------------------------------------------------
// NFA
// ---------------------------------------------------------------------------

/// Index of an NFA state in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NfaId(pub u32);

impl NfaId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A half-open symbol range `[lb, ub)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymRange {
    pub lb: u32,
    pub ub: u32,
}

/// The discriminated part of an NFA state.
///
/// `Nil`, `Alt` and `Tag` are ε-states, consumed during closure
/// construction; `Ran` and `Fin` are the kernel states that closures
/// are made of.
#[derive(Clone, Debug)]
pub enum NfaKind {
    /// One ε-successor.
    Nil { out: NfaId },
    /// Two ε-successors, `out1` preferred.
    Alt { out1: NfaId, out2: NfaId },
    /// Record a tag write, then continue along `out`.
    Tag { out: NfaId, tag: usize, bottom: bool },
    /// Consume one symbol from `ranges`, then continue along `out`.
    Ran { out: NfaId, ranges: Box<[SymRange]> },
    /// Accept.
    Fin,
}

/// An NFA state: kind, owning rule, and the ε-traversal bound counter.
#[derive(Clone, Debug)]
pub struct NfaState {
    pub kind: NfaKind,
    pub rule: usize,
    loops: u8,
}

/// `nfa.states[id]` — typed access to the state arena.
impl Index<NfaId> for Vec<NfaState> {
    type Output = NfaState;

    #[inline]
    fn index(&self, idx: NfaId) -> &NfaState {
        &self[idx.idx()]
    }
}

impl IndexMut<NfaId> for Vec<NfaState> {
    #[inline]
    fn index_mut(&mut self, idx: NfaId) -> &mut NfaState {
        &mut self[idx.idx()]
    }
}

/// One lexer rule.  Priority is the index in the rules table (smaller
/// index = higher priority).
#[derive(Debug)]
pub struct Rule {
    /// First tag index owned by this rule.
    pub lvar: usize,
    /// One past the last tag index owned by this rule.
    pub hvar: usize,
    /// Accept code reported when this rule matches.
    pub accept: u32,
    /// Source line of the rule, for shadowing diagnostics.
    pub line: u32,
    /// Source lines of higher-priority rules that shadow this one.
    pub shadow: BTreeSet<u32>,
}

/// A tagged NFA over a dense symbol alphabet `[0, nchars)`.
#[derive(Debug)]
pub struct Nfa {
    pub states: Vec<NfaState>,
    pub root: NfaId,
    pub rules: Vec<Rule>,
    pub ntags: usize,
    pub nchars: u32,
}

impl Nfa {
    /// An empty NFA; used together with [`add`](Self::add) to assemble
    /// automata by hand.  [`NfaBuilder`] is the front-end path.
    pub fn new(ntags: usize, nchars: u32) -> Self {
        Nfa {
            states: Vec::new(),
            root: NfaId(0),
            rules: Vec::new(),
            ntags,
            nchars,
        }
    }

    /// Push a state and return its index.
    pub fn add(&mut self, kind: NfaKind, rule: usize) -> NfaId {
        let id = NfaId(self.states.len() as u32);
        self.states.push(NfaState { kind, rule, loops: 0 });
        id
    }
}

// ---------------------------------------------------------------------------
// Closure kernel
// ---------------------------------------------------------------------------

/// One configuration of a closure: an NFA kernel state plus its tag
/// context.
///
/// `origin` is the index of the item this one derives from in the
/// previous DFA state's closure; it is only valid while that closure
/// is still alive.  `tvers` holds the tag versions before the
/// transition under construction, `ttran` the tag markers applied on
/// that transition, and `tlook` the markers gathered by ε-closure
/// after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CloseItem {
    pub state: NfaId,
    pub origin: u32,
    pub tvers: TagsId,
    pub ttran: TagsId,
    pub tlook: TagsId,
}

/// Build the tagged ε-closure of `clos_in` into `clos_out` and merge
/// the per-item transition tags into a single tag-commit record for
/// the transition under construction.
///
/// On return `clos_out` holds at most one item per NFA state and at
/// most one final item (the highest-priority rule that reached its
/// final state; lower-priority finals are recorded in their rules'
/// `shadow` sets), sorted by `(rule, state)`.  Tags that two items of
/// one rule disagree on are flagged in `badtags`; fresh tag versions
/// are allocated from `maxver`.
pub fn closure(
    nfa: &mut Nfa,
    clos_in: &[CloseItem],
    clos_out: &mut Vec<CloseItem>,
    tagpool: &mut TagPool,
    tcpool: &mut TcPool,
    badtags: &mut [bool],
    maxver: &mut TagVer,
) -> TcId {
    clos_out.clear();
    let mut tags = std::mem::take(&mut tagpool.buffer1);
    tags.fill(TAGVER_ZERO);
    for c in clos_in {
        closure_one(nfa, clos_out, tagpool, c, c.state, &mut tags);
    }
    tagpool.buffer1 = tags;

    prune_final_items(nfa, clos_out);

    // Group items by rule; the state key only makes the order total,
    // since no two items share a state.
    clos_out.sort_by_key(|c| (nfa.states[c.state].rule, c.state));

    check_nondeterminism(nfa, clos_out, tagpool, badtags);

    trace!("closure: {} items", clos_out.len());

    merge_transition_tags(clos_out, tagpool, tcpool, maxver)
}

/// Depth-first ε-expansion from `n`, accumulating tag writes in the
/// scratch vector `tags`.
///
/// Each state may be entered while its `loops` counter is at most 1,
/// i.e. at most twice along one path: tracing the first iteration of
/// every ε-loop is what exposes tag conflicts hidden inside cycles.
fn closure_one(
    nfa: &mut Nfa,
    clos: &mut Vec<CloseItem>,
    tagpool: &mut TagPool,
    c0: &CloseItem,
    n: NfaId,
    tags: &mut [TagVer],
) {
    if nfa.states[n].loops > 1 {
        return;
    }
    nfa.states[n].loops += 1;

    match &nfa.states[n].kind {
        NfaKind::Nil { out } => {
            let out = *out;
            closure_one(nfa, clos, tagpool, c0, out, tags);
        }
        NfaKind::Alt { out1, out2 } => {
            let (out1, out2) = (*out1, *out2);
            closure_one(nfa, clos, tagpool, c0, out1, tags);
            closure_one(nfa, clos, tagpool, c0, out2, tags);
        }
        NfaKind::Tag { out, tag, bottom } => {
            let (out, t, bottom) = (*out, *tag, *bottom);
            let old = tags[t];
            tags[t] = if bottom { TAGVER_BOTTOM } else { TAGVER_CURSOR };
            closure_one(nfa, clos, tagpool, c0, out, tags);
            tags[t] = old;
        }
        NfaKind::Ran { .. } | NfaKind::Fin => {
            let cand = CloseItem {
                state: n,
                origin: c0.origin,
                tvers: c0.tvers,
                ttran: c0.ttran,
                tlook: tagpool.insert(tags),
            };
            match clos.iter_mut().find(|c| c.state == n) {
                None => clos.push(cand),
                Some(c) => {
                    if is_better(c, &cand, tagpool) {
                        *c = cand;
                    }
                }
            }
        }
    }

    nfa.states[n].loops -= 1;
}

/// Compare two configurations that reached the same kernel state and
/// decide whether the new one (`c2`) wins over the existing one
/// (`c1`).
///
/// Tags are compared from the highest index down — higher-indexed tags
/// have lower priority, and the first difference decides.  For each
/// tag the lookahead tags are compared first, then the transition
/// tags, then the pre-transition versions, all under the signed order
/// of the version space.  Smaller values win: smaller versions were
/// assigned earlier, which is the "earliest match, leftmost capture"
/// disambiguation.  Equal configurations keep the existing item.
fn is_better(c1: &CloseItem, c2: &CloseItem, tagpool: &TagPool) -> bool {
    if c1.tlook == c2.tlook && c1.ttran == c2.ttran && c1.tvers == c2.tvers {
        return false;
    }

    let l1 = &tagpool[c1.tlook];
    let l2 = &tagpool[c2.tlook];
    let t1 = &tagpool[c1.ttran];
    let t2 = &tagpool[c2.ttran];
    let v1 = &tagpool[c1.tvers];
    let v2 = &tagpool[c2.tvers];

    for t in (0..tagpool.ntags()).rev() {
        // lookahead tags gathered by the ε-closure
        let (x, y) = (l1[t], l2[t]);
        if y > x {
            return false;
        }
        if y < x {
            return true;
        }

        // tags set on the transition under construction
        let (x, y) = (t1[t], t2[t]);
        if y > x {
            return false;
        }
        if y < x {
            return true;
        }

        // tag versions before the constructed transition
        let (x, y) = (v1[t], v2[t]);
        if y > x {
            return false;
        }
        if y < x {
            return true;
        }
    }

    false
}

/// Keep at most one final item per closure.
///
/// The NFA has one final state per rule, so final items in a closure
/// belong to distinct rules; the minimum-numbered rule shadows the
/// rest.  Each discarded rule records the surviving rule's source line
/// for the unreachable-rule diagnostic.
fn prune_final_items(nfa: &mut Nfa, clos: &mut Vec<CloseItem>) {
    let mut best: Option<usize> = None;
    for c in clos.iter() {
        if let NfaKind::Fin = nfa.states[c.state].kind {
            let r = nfa.states[c.state].rule;
            if best.map_or(true, |b| r < b) {
                best = Some(r);
            }
        }
    }
    let Some(keep) = best else { return };
    let line = nfa.rules[keep].line;

    let mut kept: Option<CloseItem> = None;
    let rules = &mut nfa.rules;
    let states = &nfa.states;
    clos.retain(|c| match states[c.state].kind {
        NfaKind::Fin => {
            let r = states[c.state].rule;
            if r == keep {
                kept = Some(*c);
            } else {
                rules[r].shadow.insert(line);
            }
            false
        }
        _ => true,
    });
    clos.push(kept.expect("final item for the surviving rule"));
}

/// Flag tags that are nondeterministic in this closure.
///
/// Within each rule group (the closure is sorted by rule), the first
/// item's transition tags are the reference; any tag of the rule's
/// `[lvar, hvar)` range on which another item disagrees is flagged.
/// `badtags` is only ever written `true` — a tag flagged by any
/// closure stays ambiguous for the whole run.
fn check_nondeterminism(
    nfa: &Nfa,
    clos: &[CloseItem],
    tagpool: &TagPool,
    badtags: &mut [bool],
) {
    let mut i = 0;
    while i < clos.len() {
        let r = nfa.states[clos[i].state].rule;
        let x = clos[i].ttran;
        let rule = &nfa.rules[r];

        let mut j = i + 1;
        while j < clos.len() && nfa.states[clos[j].state].rule == r {
            let y = clos[j].ttran;
            if y != x {
                let xv = &tagpool[x];
                let yv = &tagpool[y];
                for t in rule.lvar..rule.hvar {
                    if xv[t] != yv[t] {
                        badtags[t] = true;
                    }
                }
            }
            j += 1;
        }
        i = j;
    }
}

/// Merge the items' transition tags into one tag-commit record and
/// remap each item's pre-transition versions accordingly.
///
/// For every tag set by at least one item a fresh version is allocated
/// (positive for cursor writes, negative for ⊥ writes; absolute values
/// stay globally unique).  Items whose transition tags are all zero
/// keep their versions unchanged.
fn merge_transition_tags(
    clos: &mut [CloseItem],
    tagpool: &mut TagPool,
    tcpool: &mut TcPool,
    maxver: &mut TagVer,
) -> TcId {
    let ntags = tagpool.ntags();
    let mut cur = std::mem::take(&mut tagpool.buffer1);
    let mut bot = std::mem::take(&mut tagpool.buffer2);
    let mut ver = std::mem::take(&mut tagpool.buffer3);

    for t in 0..ntags {
        cur[t] = TAGVER_ZERO;
        bot[t] = TAGVER_ZERO;
        if clos.iter().any(|c| tagpool[c.ttran][t] == TAGVER_CURSOR) {
            *maxver += 1;
            cur[t] = *maxver;
        }
        if clos.iter().any(|c| tagpool[c.ttran][t] == TAGVER_BOTTOM) {
            *maxver += 1;
            bot[t] = -*maxver;
        }
    }

    for c in clos.iter_mut() {
        if c.ttran == ZERO_TAGS {
            continue;
        }
        for t in 0..ntags {
            ver[t] = match tagpool[c.ttran][t] {
                TAGVER_ZERO => tagpool[c.tvers][t],
                TAGVER_CURSOR => cur[t],
                TAGVER_BOTTOM => bot[t],
                _ => unreachable!("transition tags hold only markers"),
            };
        }
        c.tvers = tagpool.insert(&ver);
    }

    let save = tcpool.conv_to_save(&bot, &cur);
    tagpool.buffer1 = cur;
    tagpool.buffer2 = bot;
    tagpool.buffer3 = ver;
    save
}

// ---------------------------------------------------------------------------
// DFA
// ---------------------------------------------------------------------------

/// Index of a DFA state.  State 0 is the start state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DfaId(pub u32);

impl DfaId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One outgoing character span of a DFA state.  The lower bound is
/// implicit (the previous span's `ub`, or 0); `to == None` is the
/// missing transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub ub: u32,
    pub to: Option<DfaId>,
    /// Tag writes performed when this span is taken.
    pub save: TcId,
}

/// A DFA state: its spans cover the whole alphabet `[0, nchars)` in
/// ascending order.
#[derive(Clone, Debug)]
pub struct DfaState {
    pub spans: Vec<Span>,
    /// Accept code, when some rule reached its final state here.
    pub rule: Option<u32>,
    /// Tag versions live at entry, one handle per closure item.
    pub tvers: Vec<TagsId>,
}

#[derive(Clone, Debug)]
pub struct Dfa {
    pub states: Vec<DfaState>,
    pub nchars: u32,
}

impl Dfa {
    /// Follow the span covering `sym` out of `from`.
    pub fn step(&self, from: DfaId, sym: u32) -> Option<DfaId> {
        debug_assert!(sym < self.nchars);
        for span in &self.states[from.idx()].spans {
            if sym < span.ub {
                return span.to;
            }
        }
        None
    }

    /// Maximal-munch reference simulation from the start state.
    ///
    /// Returns the offset just past the longest accepted prefix and
    /// the accept code of its rule, or `(0, None)` when no prefix is
    /// accepted.
    pub fn run(&self, input: &[u32]) -> (usize, Option<u32>) {
        let mut state = DfaId(0);
        let mut matched = (0, self.states[0].rule);
        for (pos, &sym) in input.iter().enumerate() {
            match self.step(state, sym) {
                None => break,
                Some(next) => {
                    state = next;
                    if let Some(rule) = self.states[next.idx()].rule {
                        matched = (pos + 1, Some(rule));
                    }
                }
            }
        }
        matched
    }
}

// ---------------------------------------------------------------------------
// Determinization driver
// ---------------------------------------------------------------------------

/// Everything produced by one determinization run.
#[derive(Debug)]
pub struct Determinization {
    pub dfa: Dfa,
    pub tagpool: TagPool,
    pub tcpool: TcPool,
    /// `badtags[t]` — tag `t` is ambiguous somewhere in the DFA.
    pub badtags: Vec<bool>,
    /// Highest allocated tag version.
    pub maxver: TagVer,
}

/// A closure reduced to its identity: per item, the kernel state, the
/// canonically renumbered pre-transition versions, and the lookahead
/// tags.
type KernelKey = Vec<(NfaId, Box<[TagVer]>, TagsId)>;

/// Canonicalise a closure for state lookup.
///
/// Fresh versions are allocated on every kernel call, so raw `tvers`
/// handles would make every tagged transition produce a "new" state.
/// Renumbering versions densely in order of first use (signs
/// preserved) equates kernels with isomorphic version structure, which
/// bounds the state space of tagged loops.
fn kernel_key(clos: &[CloseItem], tagpool: &TagPool) -> KernelKey {
    let mut renames: HashMap<TagVer, TagVer> = HashMap::new();
    let mut next: TagVer = 0;
    clos.iter()
        .map(|c| {
            let canon: Box<[TagVer]> = tagpool[c.tvers]
                .iter()
                .map(|&v| {
                    if v == TAGVER_ZERO {
                        TAGVER_ZERO
                    } else {
                        let id = *renames.entry(v.abs()).or_insert_with(|| {
                            next += 1;
                            next
                        });
                        if v < 0 {
                            -id
                        } else {
                            id
                        }
                    }
                })
                .collect();
            (c.state, canon, c.tlook)
        })
        .collect()
}

/// Subset construction: convert a tagged NFA into a [`Dfa`].
///
/// The NFA is borrowed mutably for the ε-traversal counters and the
/// per-rule `shadow` sets; its structure is not changed.
pub fn determinize(nfa: &mut Nfa) -> Determinization {
    let mut tagpool = TagPool::new(nfa.ntags);
    let mut tcpool = TcPool::new();
    let mut badtags = vec![false; nfa.ntags];
    let mut maxver: TagVer = 0;

    let mut kernels: IndexMap<KernelKey, u32> = IndexMap::new();
    let mut closures: Vec<Vec<CloseItem>> = Vec::new();
    let mut dfa_states: Vec<DfaState> = Vec::new();

    let seed = [CloseItem {
        state: nfa.root,
        origin: 0,
        tvers: ZERO_TAGS,
        ttran: ZERO_TAGS,
        tlook: ZERO_TAGS,
    }];
    let mut clos = Vec::new();
    closure(
        nfa,
        &seed,
        &mut clos,
        &mut tagpool,
        &mut tcpool,
        &mut badtags,
        &mut maxver,
    );
    kernels.insert(kernel_key(&clos, &tagpool), 0);
    closures.push(clos);

    let mut i = 0;
    while i < closures.len() {
        let items = closures[i].clone();

        // One transition per distinct reach set; symbols sharing a
        // reach set share the kernel call and the resulting spans.
        let mut trans: IndexMap<Vec<CloseItem>, (Option<DfaId>, TcId)> = IndexMap::new();
        let mut per_sym: Vec<usize> = Vec::with_capacity(nfa.nchars as usize);

        for sym in 0..nfa.nchars {
            let mut reach: Vec<CloseItem> = Vec::new();
            for (oi, it) in items.iter().enumerate() {
                if let NfaKind::Ran { out, ref ranges } = nfa.states[it.state].kind {
                    if ranges.iter().any(|r| r.lb <= sym && sym < r.ub) {
                        reach.push(CloseItem {
                            state: out,
                            origin: oi as u32,
                            tvers: it.tvers,
                            ttran: it.tlook,
                            tlook: ZERO_TAGS,
                        });
                    }
                }
            }

            let ti = match trans.get_index_of(&reach) {
                Some(ti) => ti,
                None => {
                    let value = if reach.is_empty() {
                        (None, TC_NONE)
                    } else {
                        let mut next_clos = Vec::new();
                        let save = closure(
                            nfa,
                            &reach,
                            &mut next_clos,
                            &mut tagpool,
                            &mut tcpool,
                            &mut badtags,
                            &mut maxver,
                        );
                        if next_clos.is_empty() {
                            (None, TC_NONE)
                        } else {
                            let key = kernel_key(&next_clos, &tagpool);
                            let id = match kernels.get(&key) {
                                Some(&id) => id,
                                None => {
                                    let id = closures.len() as u32;
                                    trace!("dfa state {} with {} items", id, next_clos.len());
                                    kernels.insert(key, id);
                                    closures.push(next_clos);
                                    id
                                }
                            };
                            (Some(DfaId(id)), save)
                        }
                    };
                    trans.insert_full(reach, value).0
                }
            };
            per_sym.push(ti);
        }

        // Compress the per-symbol transitions into spans.
        let mut spans = Vec::new();
        let mut start = 0usize;
        for sym in 1..=nfa.nchars as usize {
            if sym == nfa.nchars as usize || per_sym[sym] != per_sym[start] {
                let (to, save) = trans[per_sym[start]];
                spans.push(Span { ub: sym as u32, to, save });
                start = sym;
            }
        }

        let rule = closures[i].iter().find_map(|c| match nfa.states[c.state].kind {
            NfaKind::Fin => Some(nfa.rules[nfa.states[c.state].rule].accept),
            _ => None,
        });
        let tvers = closures[i].iter().map(|c| c.tvers).collect();
        dfa_states.push(DfaState { spans, rule, tvers });

        i += 1;
    }

    debug!(
        "determinization complete: {} states, maxver {}",
        dfa_states.len(),
        maxver
    );

    Determinization {
        dfa: Dfa { states: dfa_states, nchars: nfa.nchars },
        tagpool,
        tcpool,
        badtags,
        maxver,
    }
}

// ---------------------------------------------------------------------------
// Skeleton graph
// ---------------------------------------------------------------------------

/// Hard ceiling on the generated corpus size: 1 GiB.
pub const MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// `path_len` value meaning "no terminating suffix known yet".
const INVALID_PATH_LEN: u32 = u32::MAX;

/// Index of a skeleton node.  Node 0 mirrors the DFA start state; the
/// last node is the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SkelId(pub u32);

impl SkelId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One enumerated input string.
///
/// `length` is the match end: the offset of the last accepting state
/// passed along the path.  It may be less than `chars.len()` when the
/// path continues past the accept (the generated lexer is expected to
/// back up to it).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    pub chars: Vec<u32>,
    pub length: usize,
    pub rule: Option<u32>,
}

impl Path {
    fn new(chars: Vec<u32>, length: usize, rule: Option<u32>) -> Self {
        Path { chars, length, rule }
    }

    /// Passing through an accepting state: move the match end here.
    fn update(&mut self, rule: Option<u32>) {
        if let Some(rule) = rule {
            self.rule = Some(rule);
            self.length = self.chars.len();
        }
    }

    fn extend(&mut self, rule: Option<u32>, ch: u32) {
        self.update(rule);
        self.chars.push(ch);
    }

    /// Append a terminating suffix cached on some skeleton node.
    fn append(&mut self, other: &Path) {
        if other.rule.is_some() {
            self.rule = other.rule;
            self.length = self.chars.len() + other.length;
        }
        self.chars.extend_from_slice(&other.chars);
    }
}

/// A skeleton node.
#[derive(Clone, Debug)]
pub struct SkelState {
    /// Successor node → representative characters leading to it, in
    /// span order: the span's lower bound and, when the span is wider
    /// than one, its upper bound.
    pub go: IndexMap<SkelId, Vec<u32>>,
    /// Accept code when the mirrored DFA state accepts.
    pub rule: Option<u32>,
    /// Cached suffix to some final node, built lazily in cover mode.
    path: Option<Path>,
    /// Length of the cheapest known terminating suffix.
    path_len: u32,
    /// Recursion bound over cyclic DFAs.
    visited: u8,
}

/// `skel.states[id]` — typed access to the node array.
impl Index<SkelId> for Vec<SkelState> {
    type Output = SkelState;

    #[inline]
    fn index(&self, idx: SkelId) -> &SkelState {
        &self[idx.idx()]
    }
}

impl IndexMut<SkelId> for Vec<SkelState> {
    #[inline]
    fn index_mut(&mut self, idx: SkelId) -> &mut SkelState {
        &mut self[idx.idx()]
    }
}

/// A mirror of the DFA used for self-test generation: one node per
/// DFA state plus a sink standing in for the missing transition.
#[derive(Debug)]
pub struct Skeleton {
    pub states: Vec<SkelState>,
}

impl Skeleton {
    pub fn new(dfa: &Dfa) -> Self {
        let n = dfa.states.len();
        let sink = SkelId(n as u32);
        let mut states: Vec<SkelState> = (0..=n)
            .map(|_| SkelState {
                go: IndexMap::new(),
                rule: None,
                path: None,
                path_len: INVALID_PATH_LEN,
                visited: 0,
            })
            .collect();

        for (i, s) in dfa.states.iter().enumerate() {
            states[i].rule = s.rule;
            // A state is final when nothing can be consumed from it:
            // its one span leads to the missing transition.
            let is_final = s.spans.len() == 1 && s.spans[0].to.is_none();
            if is_final {
                states[i].path = Some(Path::new(Vec::new(), 0, s.rule));
                states[i].path_len = 0;
            } else {
                let mut lb = 0u32;
                for span in &s.spans {
                    let p = span.to.map_or(sink, |d| SkelId(d.0));
                    let chars = states[i].go.entry(p).or_default();
                    chars.push(lb);
                    if span.ub - 1 > lb {
                        chars.push(span.ub - 1);
                    }
                    lb = span.ub;
                }
            }
        }

        // The sink is always final and accepts nothing.
        states[n].path = Some(Path::new(Vec::new(), 0, None));
        states[n].path_len = 0;

        Skeleton { states }
    }

    #[inline]
    pub fn start(&self) -> SkelId {
        SkelId(0)
    }

    /// A node is an end node when it has no outgoing arrows.
    #[inline]
    fn is_end(&self, s: SkelId) -> bool {
        self.states[s].go.is_empty()
    }

    // -- Size estimation ----------------------------------------------------

    /// Byte cost of exhaustive enumeration from `s`, given `count`
    /// inbound prefixes of length `len`.  Saturates at [`MAX_SIZE`];
    /// every multiplication is checked eagerly so a combinatorial
    /// blow-up exits early instead of overflowing.
    pub fn estimate_size_all(&mut self, s: SkelId, count: u64, len: u64) -> u64 {
        if self.is_end(s) {
            return count * len;
        }
        if self.states[s].visited >= 2 {
            return 0;
        }
        self.states[s].visited += 1;
        let result = self.estimate_all_edges(s, count, len);
        self.states[s].visited -= 1;
        result
    }

    fn estimate_all_edges(&mut self, s: SkelId, count: u64, len: u64) -> u64 {
        let edges: Vec<(SkelId, u64)> = self.states[s]
            .go
            .iter()
            .map(|(&p, chars)| (p, chars.len() as u64))
            .collect();
        let mut result = 0u64;
        for (p, arrows) in edges {
            let new_count = count * arrows;
            if new_count >= MAX_SIZE {
                return MAX_SIZE;
            }
            result += self.estimate_size_all(p, new_count, len + 1);
            if result >= MAX_SIZE {
                return MAX_SIZE;
            }
        }
        result
    }

    /// Byte cost of covering enumeration from `s`.  As a side effect
    /// the cheapest known suffix length is memoised in `path_len`.
    pub fn estimate_size_cover(&mut self, s: SkelId, count: u64, len: u64) -> u64 {
        if self.states[s].path_len != INVALID_PATH_LEN {
            return count * (len + self.states[s].path_len as u64);
        }
        if self.states[s].visited >= 2 {
            return 0;
        }
        self.states[s].visited += 1;
        let result = self.estimate_cover_edges(s, count, len);
        self.states[s].visited -= 1;
        result
    }

    fn estimate_cover_edges(&mut self, s: SkelId, count: u64, len: u64) -> u64 {
        let edges: Vec<(SkelId, u64)> = self.states[s]
            .go
            .iter()
            .map(|(&p, chars)| (p, chars.len() as u64))
            .collect();
        let mut result = 0u64;
        let mut dispatched = 0u64;
        let mut it = WrapIter::new(&edges);
        while !it.end() || dispatched < count {
            let &(p, arrows) = it.get();
            dispatched += arrows;
            let n = self.estimate_size_cover(p, arrows, len + 1);
            if n != 0 && self.states[s].path_len == INVALID_PATH_LEN {
                self.states[s].path_len = self.states[p].path_len + 1;
            }
            result += n;
            if result > MAX_SIZE {
                return MAX_SIZE;
            }
            it.advance();
        }
        result
    }

    // -- Path generation ----------------------------------------------------

    /// Exhaustive enumeration: every prefix is extended along every
    /// arrow, so the emitted corpus is the full (bounded) path tree.
    pub fn generate_paths_all(&mut self, s: SkelId, prefixes: &[Path], results: &mut Vec<Path>) {
        if self.is_end(s) {
            let rule = self.states[s].rule;
            for prefix in prefixes {
                let mut path = prefix.clone();
                path.update(rule);
                results.push(path);
            }
            return;
        }
        if self.states[s].visited >= 2 {
            return;
        }
        self.states[s].visited += 1;

        let rule = self.states[s].rule;
        let edges: Vec<(SkelId, Vec<u32>)> = self.states[s]
            .go
            .iter()
            .map(|(&p, chars)| (p, chars.clone()))
            .collect();
        for (p, chars) in &edges {
            let mut zs = Vec::with_capacity(prefixes.len() * chars.len());
            for prefix in prefixes {
                for &ch in chars {
                    let mut z = prefix.clone();
                    z.extend(rule, ch);
                    zs.push(z);
                }
            }
            self.generate_paths_all(*p, &zs, results);
        }

        self.states[s].visited -= 1;
    }

    /// Covering enumeration: inbound prefixes are dealt round-robin
    /// across outbound arrows, and paths are closed through the lazily
    /// cached terminating suffixes.
    pub fn generate_paths_cover(&mut self, s: SkelId, prefixes: &[Path], results: &mut Vec<Path>) {
        if let Some(suffix) = self.states[s].path.clone() {
            for prefix in prefixes {
                let mut path = prefix.clone();
                path.append(&suffix);
                results.push(path);
            }
            return;
        }
        if self.states[s].visited >= 2 {
            return;
        }
        self.states[s].visited += 1;

        let rule = self.states[s].rule;
        let edges: Vec<(SkelId, Vec<u32>)> = self.states[s]
            .go
            .iter()
            .map(|(&p, chars)| (p, chars.clone()))
            .collect();
        let in_arrows = prefixes.len();
        let mut inbound = 0usize;
        let mut it = WrapIter::new(&edges);
        while !it.end() || inbound < in_arrows {
            let (p, chars) = it.get();
            let mut zs = Vec::with_capacity(chars.len());
            for &ch in chars {
                let mut z = prefixes[inbound % in_arrows].clone();
                z.extend(rule, ch);
                zs.push(z);
                inbound += 1;
            }
            self.generate_paths_cover(*p, &zs, results);
            if self.states[s].path.is_none() {
                if let Some(child) = self.states[*p].path.clone() {
                    // Memoise a terminating suffix upward: the first
                    // character of this edge, then the child's suffix.
                    let mut suffix = Path::new(vec![chars[0]], 0, rule);
                    suffix.append(&child);
                    self.states[s].path = Some(suffix);
                }
            }
            it.advance();
        }

        self.states[s].visited -= 1;
    }

    /// Generate the corpus, picking exhaustive mode when its estimated
    /// size fits under [`MAX_SIZE`] and falling back to cover mode
    /// otherwise.  A cover-mode overrun is reported but generation
    /// still proceeds best-effort.
    pub fn generate_paths(&mut self, results: &mut Vec<Path>) {
        let prefixes = vec![Path::new(Vec::new(), 0, None)];
        let root = self.start();
        if self.estimate_size_all(root, 1, 0) == MAX_SIZE {
            if self.estimate_size_cover(root, 1, 0) == MAX_SIZE {
                warn!("generating too much data");
            }
            debug!("skeleton: covering enumeration");
            self.generate_paths_cover(root, &prefixes, results);
        } else {
            debug!("skeleton: exhaustive enumeration");
            self.generate_paths_all(root, &prefixes, results);
        }
    }

    // -- Emission -----------------------------------------------------------

    /// Write the self-test data file: the input-access macros, the
    /// concatenated corpus (padded with `max_len` zeroes so lookahead
    /// cannot read past the end), and the expected-result table.
    ///
    /// `code_unit_size` is the encoding code-unit width in bytes and
    /// selects `YYCTYPE`; it must be 1, 2 or 4.
    pub fn emit_data(&mut self, code_unit_size: u32, mut o: impl Write) -> io::Result<()> {
        let yyctype = match code_unit_size {
            1 => "unsigned char",
            2 => "unsigned short",
            4 => "unsigned int",
            _ => panic!("code unit size must be 1, 2 or 4"),
        };

        writeln!(o, "#define YYCTYPE {}", yyctype)?;
        writeln!(o, "#define YYPEEK() *cursor")?;
        writeln!(o, "#define YYSKIP() ++cursor")?;
        writeln!(o, "#define YYBACKUP() marker = cursor")?;
        writeln!(o, "#define YYBACKUPCTX() ctxmarker = cursor")?;
        writeln!(o, "#define YYRESTORE() cursor = marker")?;
        writeln!(o, "#define YYRESTORECTX() cursor = ctxmarker")?;
        writeln!(o, "#define YYLESSTHAN(n) (limit - cursor) < n")?;
        writeln!(o, "#define YYFILL(n) {{ break; }}")?;

        let mut ys = Vec::new();
        self.generate_paths(&mut ys);

        let max_len = ys.iter().map(|y| y.chars.len()).max().unwrap_or(0);

        writeln!(o, "// These strings correspond to paths in DFA.")?;
        writeln!(o, "YYCTYPE data [] =")?;
        writeln!(o, "{{")?;
        for y in &ys {
            write!(o, "\t")?;
            for &ch in &y.chars {
                write_char_or_hex(&mut o, ch, code_unit_size)?;
                write!(o, ",")?;
            }
            writeln!(o)?;
        }
        write!(o, "\t")?;
        for _ in 0..max_len {
            write!(o, "0,")?;
        }
        writeln!(o)?;
        writeln!(o, "}};")?;
        writeln!(o, "const unsigned int data_size = sizeof (data) / sizeof (YYCTYPE);")?;
        writeln!(o, "const unsigned int count = {};", ys.len())?;

        writeln!(o, "struct Result {{")?;
        writeln!(o, "\tunsigned int endpos;")?;
        writeln!(o, "\tunsigned int startpos;")?;
        writeln!(o, "\tunsigned int rule;")?;
        writeln!(
            o,
            "\tResult (unsigned int e, unsigned int s, unsigned int r) : endpos (e), startpos (s), rule (r) {{}}"
        )?;
        writeln!(o, "}};")?;
        writeln!(o, "Result result [] =")?;
        writeln!(o, "{{")?;
        let mut pos = 0usize;
        for y in &ys {
            writeln!(
                o,
                "\tResult ({},{},{}),",
                pos + y.length,
                pos + y.chars.len(),
                y.rule.map_or(u32::MAX, |r| r)
            )?;
            pos += y.chars.len();
        }
        writeln!(o, "}};")?;

        writeln!(o, "const YYCTYPE * cursor = data;")?;
        writeln!(o, "const YYCTYPE * marker = data;")?;
        writeln!(o, "const YYCTYPE * ctxmarker = data;")?;
        writeln!(o, "const YYCTYPE * const limit = &data[data_size - 1];")?;
        Ok(())
    }
}

/// Round-robin iterator over a node's edges: a real pass over the
/// slice, then wrapping continuation until the caller has dispatched
/// all inbound prefixes.
struct WrapIter<'a, T> {
    items: &'a [T],
    pos: usize,
}

impl<'a, T> WrapIter<'a, T> {
    fn new(items: &'a [T]) -> Self {
        assert!(!items.is_empty(), "wrap iteration over a node with no edges");
        WrapIter { items, pos: 0 }
    }

    /// True once the first (real) pass over the edges is complete.
    #[inline]
    fn end(&self) -> bool {
        self.pos >= self.items.len()
    }

    #[inline]
    fn get(&self) -> &'a T {
        &self.items[self.pos % self.items.len()]
    }

    #[inline]
    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Print a character as a C literal when printable ASCII, as a hex
/// constant of the code unit's width otherwise.
fn write_char_or_hex(o: &mut impl Write, ch: u32, code_unit_size: u32) -> io::Result<()> {
    if (0x20..0x7F).contains(&ch) && ch != u32::from(b'\'') && ch != u32::from(b'\\') {
        write!(o, "'{}'", ch as u8 as char)
    } else {
        match code_unit_size {
            1 => write!(o, "0x{:02X}", ch),
            2 => write!(o, "0x{:04X}", ch),
            _ => write!(o, "0x{:08X}", ch),
        }
    }
}

/// Write the opening of the generated self-test `main` that loops over
/// `result[]`.
pub fn emit_prolog(mut o: impl Write, data_name: &str) -> io::Result<()> {
    writeln!(o, "#include <stdio.h>")?;
    writeln!(o, "#include \"{}\"", data_name)?;
    writeln!(o, "int main ()")?;
    writeln!(o, "{{")?;
    writeln!(o, "\tfor (unsigned int i = 0; i < count; ++i)")?;
    writeln!(o, "\t{{")?;
    Ok(())
}

/// Close the generated self-test `main`.
pub fn emit_epilog(mut o: impl Write) -> io::Result<()> {
    writeln!(o, "\t}}")?;
    writeln!(o, "\treturn 0;")?;
    writeln!(o, "}}")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// NFA builder (regex-syntax HIR -> tagged NFA)
// ---------------------------------------------------------------------------

/// Builds a tagged [`Nfa`] from one `regex_syntax::hir::Hir` per lexer
/// rule.
///
/// Sub-NFAs are wired back to front: each lowering step receives the
/// state to continue to and returns its entry state, so fixed-arity
/// arena nodes need no dangling-pointer patching (loops patch their
/// single back edge explicitly).  Capture groups lower to an open/close
/// pair of cursor tags around the group body; alternation and optional
/// repetition prepend ⊥ tags on a branch for every tag of the sibling
/// branches it bypasses, so "the group did not fire" is observable.
#[derive(Debug, Default)]
pub struct NfaBuilder {
    states: Vec<NfaState>,
    rules: Vec<Rule>,
    rule_roots: Vec<NfaId>,
    ntags: usize,
}

impl NfaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule.  Rules are prioritised in insertion order; the
    /// accept code is the rule's index.  `line` is the rule's source
    /// line, used in shadowing diagnostics.
    pub fn add_rule(&mut self, hir: &Hir, line: u32) -> Result<usize, Error> {
        let rule = self.rules.len();
        let lvar = self.ntags;
        self.ntags += 2 * max_capture(hir) as usize;
        let hvar = self.ntags;
        self.rules.push(Rule {
            lvar,
            hvar,
            accept: rule as u32,
            line,
            shadow: BTreeSet::new(),
        });

        let fin = self.state(NfaKind::Fin, rule);
        let start = self.compile(hir, rule, lvar, fin)?;
        self.rule_roots.push(start);
        Ok(rule)
    }

    /// Assemble the final NFA: rule entry points are chained with ALT
    /// nodes, first rule preferred.
    pub fn build(self) -> Nfa {
        assert!(!self.rule_roots.is_empty(), "a lexer needs at least one rule");
        let mut states = self.states;
        let mut roots = self.rule_roots;

        let mut root = roots.pop().expect("at least one rule root");
        while let Some(r) = roots.pop() {
            let id = NfaId(states.len() as u32);
            states.push(NfaState {
                kind: NfaKind::Alt { out1: r, out2: root },
                rule: states[r.idx()].rule,
                loops: 0,
            });
            root = id;
        }

        Nfa {
            states,
            root,
            rules: self.rules,
            ntags: self.ntags,
            nchars: 256,
        }
    }

    fn state(&mut self, kind: NfaKind, rule: usize) -> NfaId {
        let id = NfaId(self.states.len() as u32);
        self.states.push(NfaState { kind, rule, loops: 0 });
        id
    }

    /// Chain of ⊥ tags for every tag in `tags`, ending at `next`.
    fn bottom_chain(&mut self, tags: &BTreeSet<usize>, rule: usize, next: NfaId) -> NfaId {
        let mut out = next;
        for &t in tags.iter().rev() {
            out = self.state(NfaKind::Tag { out, tag: t, bottom: true }, rule);
        }
        out
    }

    /// Lower `hir` into states continuing to `next`; returns the entry
    /// state of the lowered fragment.
    fn compile(&mut self, hir: &Hir, rule: usize, lvar: usize, next: NfaId) -> Result<NfaId, Error> {
        match hir.kind() {
            HirKind::Empty => Ok(next),
            HirKind::Literal(lit) => {
                let mut out = next;
                for &b in lit.0.iter().rev() {
                    let ranges = vec![SymRange { lb: b as u32, ub: b as u32 + 1 }];
                    out = self.state(
                        NfaKind::Ran { out, ranges: ranges.into_boxed_slice() },
                        rule,
                    );
                }
                Ok(out)
            }
            HirKind::Class(hir::Class::Bytes(class)) => {
                let ranges: Vec<SymRange> = class
                    .ranges()
                    .iter()
                    .map(|r| SymRange { lb: r.start() as u32, ub: r.end() as u32 + 1 })
                    .collect();
                Ok(self.state(
                    NfaKind::Ran { out: next, ranges: ranges.into_boxed_slice() },
                    rule,
                ))
            }
            HirKind::Class(hir::Class::Unicode(class)) => {
                // regex-syntax produces Unicode classes even for
                // ASCII-only patterns like `(a|b)` → `[ab]`.  Lower
                // them when all ranges fit in a single code unit,
                // otherwise reject.
                let ranges = class.ranges();
                let single_unit = ranges
                    .iter()
                    .all(|r| (r.start() as u32) <= 0xFF && (r.end() as u32) <= 0xFF);
                if !single_unit {
                    return Err(Error::UnsupportedClass(hir::Class::Unicode(class.clone())));
                }
                let ranges: Vec<SymRange> = ranges
                    .iter()
                    .map(|r| SymRange { lb: r.start() as u32, ub: r.end() as u32 + 1 })
                    .collect();
                Ok(self.state(
                    NfaKind::Ran { out: next, ranges: ranges.into_boxed_slice() },
                    rule,
                ))
            }
            HirKind::Look(look) => Err(Error::UnsupportedLook(*look)),
            HirKind::Capture(cap) => {
                let base = lvar + 2 * (cap.index as usize - 1);
                let close = self.state(
                    NfaKind::Tag { out: next, tag: base + 1, bottom: false },
                    rule,
                );
                let body = self.compile(&cap.sub, rule, lvar, close)?;
                Ok(self.state(NfaKind::Tag { out: body, tag: base, bottom: false }, rule))
            }
            HirKind::Concat(children) => {
                let mut out = next;
                for child in children.iter().rev() {
                    out = self.compile(child, rule, lvar, out)?;
                }
                Ok(out)
            }
            HirKind::Alternation(children) => {
                let tagsets: Vec<BTreeSet<usize>> = children
                    .iter()
                    .map(|c| {
                        let mut tags = BTreeSet::new();
                        hir_tags(c, lvar, &mut tags);
                        tags
                    })
                    .collect();
                let all: BTreeSet<usize> = tagsets.iter().flatten().copied().collect();

                let mut entries = Vec::with_capacity(children.len());
                for (i, child) in children.iter().enumerate() {
                    let missing: BTreeSet<usize> =
                        all.difference(&tagsets[i]).copied().collect();
                    let tail = self.bottom_chain(&missing, rule, next);
                    entries.push(self.compile(child, rule, lvar, tail)?);
                }

                let mut acc = entries.pop().expect("alternation has branches");
                while let Some(e) = entries.pop() {
                    acc = self.state(NfaKind::Alt { out1: e, out2: acc }, rule);
                }
                Ok(acc)
            }
            HirKind::Repetition(rep) => {
                let min = rep.min as usize;
                let max = rep.max.map(|m| m as usize);
                match (min, max) {
                    (0, Some(1)) => self.compile_opt(&rep.sub, rule, lvar, next),
                    (0, None) => self.compile_star(&rep.sub, rule, lvar, next, true),
                    (1, None) => self.compile_plus(&rep.sub, rule, lvar, next),
                    (min, None) => {
                        // r{min,} — mandatory copies, then a loop.
                        let mut out = self.compile_star(&rep.sub, rule, lvar, next, false)?;
                        for _ in 0..min {
                            out = self.compile(&rep.sub, rule, lvar, out)?;
                        }
                        Ok(out)
                    }
                    (min, Some(max)) => {
                        debug_assert!(min <= max);
                        // r{min,max} — unroll: min mandatory copies,
                        // then max-min nested optional copies.  Only
                        // the outermost optional of an r{0,max} gets
                        // the ⊥ arm: with min > 0 the mandatory copies
                        // already committed the tags.
                        let mut tags = BTreeSet::new();
                        hir_tags(&rep.sub, lvar, &mut tags);
                        let mut out = next;
                        for i in 0..max - min {
                            let body = self.compile(&rep.sub, rule, lvar, out)?;
                            let skip = if min == 0 && i == max - min - 1 {
                                self.bottom_chain(&tags, rule, next)
                            } else {
                                next
                            };
                            out = self.state(NfaKind::Alt { out1: body, out2: skip }, rule);
                        }
                        for _ in 0..min {
                            out = self.compile(&rep.sub, rule, lvar, out)?;
                        }
                        Ok(out)
                    }
                }
            }
        }
    }

    /// `r?` — take the body, or bypass it ⊥-setting its tags.
    fn compile_opt(&mut self, sub: &Hir, rule: usize, lvar: usize, next: NfaId) -> Result<NfaId, Error> {
        let mut tags = BTreeSet::new();
        hir_tags(sub, lvar, &mut tags);
        let skip = self.bottom_chain(&tags, rule, next);
        let body = self.compile(sub, rule, lvar, next)?;
        Ok(self.state(NfaKind::Alt { out1: body, out2: skip }, rule))
    }

    /// `r*` — one-or-more loop, or a bypass arm.  The bypass carries
    /// ⊥ tags only for a bare star (`with_bottoms`); as the tail of an
    /// unrolled `r{min,}` the tags are already committed.
    fn compile_star(
        &mut self,
        sub: &Hir,
        rule: usize,
        lvar: usize,
        next: NfaId,
        with_bottoms: bool,
    ) -> Result<NfaId, Error> {
        let body = self.compile_plus(sub, rule, lvar, next)?;
        let skip = if with_bottoms {
            let mut tags = BTreeSet::new();
            hir_tags(sub, lvar, &mut tags);
            self.bottom_chain(&tags, rule, next)
        } else {
            next
        };
        Ok(self.state(NfaKind::Alt { out1: body, out2: skip }, rule))
    }

    /// `r+` — the body loops through an ALT that either re-enters it
    /// or exits to `next`.
    fn compile_plus(&mut self, sub: &Hir, rule: usize, lvar: usize, next: NfaId) -> Result<NfaId, Error> {
        let alt = self.state(NfaKind::Alt { out1: next, out2: next }, rule);
        let body = self.compile(sub, rule, lvar, alt)?;
        if let NfaKind::Alt { out1, .. } = &mut self.states[alt.idx()].kind {
            *out1 = body;
        }
        Ok(body)
    }
}

/// Highest capture-group index in `hir` (0 when there are no groups).
fn max_capture(hir: &Hir) -> u32 {
    match hir.kind() {
        HirKind::Capture(cap) => cap.index.max(max_capture(&cap.sub)),
        HirKind::Concat(xs) | HirKind::Alternation(xs) => {
            xs.iter().map(max_capture).max().unwrap_or(0)
        }
        HirKind::Repetition(rep) => max_capture(&rep.sub),
        _ => 0,
    }
}

/// Collect the tag indices (relative to `lvar`) of every capture group
/// in `hir`.
fn hir_tags(hir: &Hir, lvar: usize, out: &mut BTreeSet<usize>) {
    match hir.kind() {
        HirKind::Capture(cap) => {
            let base = lvar + 2 * (cap.index as usize - 1);
            out.insert(base);
            out.insert(base + 1);
            hir_tags(&cap.sub, lvar, out);
        }
        HirKind::Concat(xs) | HirKind::Alternation(xs) => {
            for x in xs {
                hir_tags(x, lvar, out);
            }
        }
        HirKind::Repetition(rep) => hir_tags(&rep.sub, lvar, out),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
