//! Lowering interface between decision structures and an instruction emitter.
//!
//! The dispatch compiler does not encode instructions. It drives a
//! [`DecisionEmitter`] through a fixed sequence of abstract operations; the
//! emitter turns each into target code and fixup requests.
//!
//! Shape of the emitted code:
//!
//! ```text
//! sequential:    cmp k0 -> L0; cmp k1 -> L0; cmp k2 -> L1; ...; miss
//! lookup-table:  slice; guard keys[slice] -> miss; result = values[slice]; jump end
//! branch-table:  slice; probe primary/secondary -> miss; jump table[slice]
//!                D_i: cmp test -> L_then; jump L_else
//! bodies:        L_c: action(c); jump end
//!                miss: miss action
//!                end:
//! ```

use super::decision::{BranchTarget, DecisionCode, MissAction};
use super::key::DispatchKey;
use super::plan::HashWindow;
use super::Action;
use crate::backend::literal::Literal;

/// Abstract operations an instruction emitter provides for dispatch code
pub trait DecisionEmitter {
    type Label: Copy;

    fn new_label(&mut self) -> Self::Label;
    fn place_label(&mut self, label: Self::Label);
    fn jump(&mut self, label: Self::Label);

    /// Branch to `label` when the input equals `key`
    fn branch_if_eq(&mut self, key: &DispatchKey, label: Self::Label);

    /// Compute the hash slice of the input into the index register
    fn hash_slice(&mut self, window: HashWindow);

    /// Branch to `on_miss` unless `keys[index] == input`, or `secondary[index] == input` when present
    fn probe(
        &mut self,
        primary: &[Option<DispatchKey>],
        secondary: Option<&[Option<DispatchKey>]>,
        on_miss: Self::Label,
    );

    /// Load `values[index]` as the result
    fn load_value(&mut self, values: &[Option<Literal>]);

    /// Indirect jump through a table of labels indexed by the index register
    fn jump_table(&mut self, labels: &[Self::Label]);

    /// Emit a clause (or default) action as the result
    fn action(&mut self, action: &Action);

    /// Emit the miss path: either a call to the miss handler or a nil result
    fn signal_miss(&mut self);
    fn no_value(&mut self);
}

/// Inputs for lowering that live outside the decision structure itself
pub struct LoweringInput<'a> {
    pub actions: &'a [Action],
    pub default: Option<&'a Action>,
    pub miss: MissAction,
}

pub fn lower<E: DecisionEmitter>(code: &DecisionCode, input: &LoweringInput<'_>, emitter: &mut E) {
    let end = emitter.new_label();
    let miss = emitter.new_label();
    let clause_labels: Vec<E::Label> = input.actions.iter().map(|_| emitter.new_label()).collect();

    match code {
        DecisionCode::Sequential(seq) => {
            for arm in &seq.arms {
                for key in &arm.keys {
                    emitter.branch_if_eq(key, clause_labels[arm.clause]);
                }
            }
            emitter.jump(miss);
        }
        DecisionCode::LookupTable(table) => {
            emitter.hash_slice(table.window);
            emitter.probe(&table.keys, None, miss);
            emitter.load_value(&table.values);
            emitter.jump(end);
        }
        DecisionCode::BranchTable(table) => {
            emitter.hash_slice(table.window);
            emitter.probe(&table.primary, table.secondary.as_deref(), miss);

            let target_labels: Vec<E::Label> = table
                .targets
                .iter()
                .map(|t| match t {
                    BranchTarget::Clause(c) => clause_labels[*c],
                    BranchTarget::Miss => miss,
                    BranchTarget::Disambiguate { .. } => emitter.new_label(),
                })
                .collect();
            let slice_labels: Vec<E::Label> =
                table.jump_table.iter().map(|&t| target_labels[t]).collect();
            emitter.jump_table(&slice_labels);

            for (target, &label) in table.targets.iter().zip(&target_labels) {
                if let BranchTarget::Disambiguate {
                    test,
                    then_clause,
                    else_clause,
                } = target
                {
                    emitter.place_label(label);
                    emitter.branch_if_eq(test, clause_labels[*then_clause]);
                    emitter.jump(clause_labels[*else_clause]);
                }
            }
        }
    }

    // Lookup tables never reach clause bodies.
    if !matches!(code, DecisionCode::LookupTable(_)) {
        for (action, &label) in input.actions.iter().zip(&clause_labels) {
            emitter.place_label(label);
            emitter.action(action);
            emitter.jump(end);
        }
    }

    emitter.place_label(miss);
    match (input.miss, input.default) {
        (MissAction::Default, Some(default)) => emitter.action(default),
        (MissAction::Error, _) => emitter.signal_miss(),
        _ => emitter.no_value(),
    }
    emitter.place_label(end);
}
