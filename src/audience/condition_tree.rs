//! Nested `and`/`or`/`not` condition trees with three-valued logic.
use serde_json::Value;

/// Result of evaluating a condition. `Unknown` is returned when a condition cannot be evaluated
/// (missing attribute, type mismatch, malformed tree) and is distinct from `False`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tristate {
    #[allow(missing_docs)]
    True,
    #[allow(missing_docs)]
    False,
    #[allow(missing_docs)]
    Unknown,
}

impl Tristate {
    /// Collapse to a boolean, treating `Unknown` as not matching.
    pub fn is_true(self) -> bool {
        self == Tristate::True
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        if value {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

impl From<Option<bool>> for Tristate {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Tristate::Unknown, Tristate::from)
    }
}

impl std::ops::Not for Tristate {
    type Output = Tristate;

    fn not(self) -> Tristate {
        match self {
            Tristate::True => Tristate::False,
            Tristate::False => Tristate::True,
            Tristate::Unknown => Tristate::Unknown,
        }
    }
}

/// A condition tree over leaves of type `L`.
///
/// `Not` keeps all of its operands so that a malformed tree (zero or several operands) can be
/// reported as `Unknown` instead of being silently repaired.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionTree<L> {
    #[allow(missing_docs)]
    Leaf(L),
    #[allow(missing_docs)]
    And(Vec<ConditionTree<L>>),
    #[allow(missing_docs)]
    Or(Vec<ConditionTree<L>>),
    #[allow(missing_docs)]
    Not(Vec<ConditionTree<L>>),
}

const AND_OPERATOR: &str = "and";
const OR_OPERATOR: &str = "or";
const NOT_OPERATOR: &str = "not";

impl<L> ConditionTree<L> {
    /// Build a tree from its JSON representation, e.g. `["and", ["or", "1", "2"], "3"]`.
    ///
    /// A list without an explicit operator in first position is an implicit `or` over all of its
    /// elements. Anything that is not a list is a leaf and is handed to `parse_leaf`.
    pub fn from_json(value: &Value, parse_leaf: &impl Fn(&Value) -> L) -> ConditionTree<L> {
        let Value::Array(items) = value else {
            return ConditionTree::Leaf(parse_leaf(value));
        };

        let operator = items.first().and_then(Value::as_str);
        let (operator, operands) = match operator {
            Some(AND_OPERATOR) => (AND_OPERATOR, &items[1..]),
            Some(OR_OPERATOR) => (OR_OPERATOR, &items[1..]),
            Some(NOT_OPERATOR) => (NOT_OPERATOR, &items[1..]),
            _ => (OR_OPERATOR, &items[..]),
        };

        let operands = operands
            .iter()
            .map(|it| ConditionTree::from_json(it, parse_leaf))
            .collect();

        match operator {
            AND_OPERATOR => ConditionTree::And(operands),
            NOT_OPERATOR => ConditionTree::Not(operands),
            _ => ConditionTree::Or(operands),
        }
    }

    /// Evaluate the tree, calling `leaf_evaluator` for every leaf that needs to be inspected.
    ///
    /// An empty top-level list evaluates to `Unknown`.
    pub fn evaluate<F>(&self, leaf_evaluator: &mut F) -> Tristate
    where
        F: FnMut(&L) -> Tristate,
    {
        match self {
            ConditionTree::Leaf(leaf) => leaf_evaluator(leaf),
            ConditionTree::And(operands) | ConditionTree::Or(operands) if operands.is_empty() => {
                Tristate::Unknown
            }
            ConditionTree::And(operands) => {
                let mut saw_unknown = false;
                for operand in operands {
                    match operand.evaluate(leaf_evaluator) {
                        Tristate::False => return Tristate::False,
                        Tristate::Unknown => saw_unknown = true,
                        Tristate::True => {}
                    }
                }
                if saw_unknown {
                    Tristate::Unknown
                } else {
                    Tristate::True
                }
            }
            ConditionTree::Or(operands) => {
                let mut saw_unknown = false;
                for operand in operands {
                    match operand.evaluate(leaf_evaluator) {
                        Tristate::True => return Tristate::True,
                        Tristate::Unknown => saw_unknown = true,
                        Tristate::False => {}
                    }
                }
                if saw_unknown {
                    Tristate::Unknown
                } else {
                    Tristate::False
                }
            }
            ConditionTree::Not(operands) => match operands.as_slice() {
                [operand] => !operand.evaluate(leaf_evaluator),
                _ => Tristate::Unknown,
            },
        }
    }

    /// Visit every leaf of the tree in order.
    pub fn for_each_leaf<F: FnMut(&L)>(&self, f: &mut F) {
        match self {
            ConditionTree::Leaf(leaf) => f(leaf),
            ConditionTree::And(operands)
            | ConditionTree::Or(operands)
            | ConditionTree::Not(operands) => {
                for operand in operands {
                    operand.for_each_leaf(f);
                }
            }
        }
    }
}
