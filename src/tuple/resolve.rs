//! Plan-time resolution of operation arguments and outputs.
//!
//! The planner resolves every `Each` and `Every` exactly once against the
//! schema flowing into it. The result is a set of precomputed selectors, so
//! the stack never looks a field up by name while processing records.

use super::fields::{FieldRef, Fields, FieldsError, FieldsKind, Selector};
use super::Tuple;

/// How an outgoing tuple is assembled from the incoming tuple and one
/// operation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSelector {
    /// The incoming tuple passes through untouched (filters).
    Incoming,
    /// `incoming ++ result`.
    Append,
    /// The result alone.
    Results,
    /// The incoming tuple with the argument values overwritten in place.
    Replace(Selector),
    /// The incoming tuple without the arguments, then the result.
    Swap { retained: Vec<usize> },
    /// Positions picked out of `incoming ++ result`.
    Select(Vec<usize>),
}

impl OutputSelector {
    /// `None` when the result does not fit the selector's shape.
    pub fn apply(&self, incoming: &Tuple, result: &Tuple) -> Option<Tuple> {
        match self {
            OutputSelector::Incoming => Some(incoming.clone()),
            OutputSelector::Append => Some(incoming.append(result)),
            OutputSelector::Results => Some(result.clone()),
            OutputSelector::Replace(Selector::All) => {
                (result.size() == incoming.size()).then(|| result.clone())
            }
            OutputSelector::Replace(Selector::Positions(positions)) => {
                let mut out = incoming.clone();
                out.put(positions, result).then_some(out)
            }
            OutputSelector::Swap { retained } => {
                incoming.select(retained).map(|kept| kept.append(result))
            }
            OutputSelector::Select(positions) => incoming.append(result).select(positions),
        }
    }
}

/// Precomputed wiring for one `Each`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EachResolution {
    pub arguments: Selector,
    pub argument_fields: Fields,
    /// Declared fields after `ARGS`/`ALL` substitution.
    pub declared: Fields,
    pub outgoing: Fields,
    pub output: OutputSelector,
}

/// Precomputed wiring for one `Every`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EveryResolution {
    pub arguments: Selector,
    pub argument_fields: Fields,
    pub declared: Fields,
    /// Fields of the tuple the result is combined with: the grouping key for
    /// the first aggregator, the previous aggregator's output afterwards.
    pub previous: Fields,
    pub outgoing: Fields,
    pub output: OutputSelector,
}

fn substitute_declared(declared: &Fields, argument_fields: &Fields) -> Result<Fields, FieldsError> {
    match declared.kind() {
        FieldsKind::Defined => Ok(declared.clone()),
        FieldsKind::Args => Ok(argument_fields.clone()),
        FieldsKind::Unknown => Ok(Fields::unknown()),
        kind => Err(FieldsError::Unresolvable {
            kind,
            usage: "a field declaration".to_string(),
        }),
    }
}

/// Check an operation's expected argument count against resolved arguments.
pub fn check_num_args(expected: Option<usize>, argument_fields: &Fields) -> Result<(), FieldsError> {
    match (expected, argument_fields.arity()) {
        (Some(expected), Some(actual)) if expected != actual => Err(FieldsError::ArityMismatch {
            context: "operation argument count".to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Resolve an explicit output selector over `left ++ right`.
fn select_over(left: &Fields, right: &Fields, selector: &Fields) -> Result<(Vec<usize>, Fields), FieldsError> {
    let mut positions = Vec::with_capacity(selector.size());
    for field in selector.refs() {
        let position = match field {
            FieldRef::Name(name) => match (left.index_of(name), right.index_of(name)) {
                (Some(_), Some(_)) => {
                    return Err(FieldsError::Ambiguous { name: name.clone() });
                }
                (Some(i), None) => i,
                (None, Some(j)) => {
                    if !left.is_defined() {
                        return Err(FieldsError::UnknownIncoming {
                            field: field.to_string(),
                        });
                    }
                    left.size() + j
                }
                (None, None) => {
                    return Err(FieldsError::NotFound {
                        field: field.to_string(),
                        available: format!("{} + {}", left, right),
                    });
                }
            },
            FieldRef::Pos(p) => {
                if !left.is_defined() || !right.is_defined() {
                    return Err(FieldsError::Unresolvable {
                        kind: FieldsKind::Unknown,
                        usage: "a positional output selector".to_string(),
                    });
                }
                let size = left.size() + right.size();
                let resolved = if *p < 0 { size as i64 + *p as i64 } else { *p as i64 };
                if resolved < 0 || resolved >= size as i64 {
                    return Err(FieldsError::OutOfRange { position: *p, size });
                }
                resolved as usize
            }
        };
        positions.push(position);
    }
    let combined = left.concat(right);
    let outgoing = Fields::with_parts(
        positions.iter().map(|&p| combined.refs()[p].clone()).collect(),
        positions.iter().map(|&p| combined.raw_comparator(p)).collect(),
    );
    Ok((positions, outgoing))
}

/// Resolve an `Each` against the schema flowing into it.
pub fn resolve_each(
    incoming: &Fields,
    arguments: &Fields,
    declared: &Fields,
    output: &Fields,
    is_filter: bool,
) -> Result<EachResolution, FieldsError> {
    let selector = arguments.positions_in(incoming)?;
    let argument_fields = arguments.select_from(incoming)?;

    if is_filter {
        return Ok(EachResolution {
            arguments: selector,
            argument_fields,
            declared: incoming.clone(),
            outgoing: incoming.clone(),
            output: OutputSelector::Incoming,
        });
    }

    let declared = substitute_declared(declared, &argument_fields)?;

    let (outgoing, output) = match output.kind() {
        FieldsKind::All => (incoming.append(&declared)?, OutputSelector::Append),
        FieldsKind::Results => (declared.clone(), OutputSelector::Results),
        FieldsKind::Replace => {
            if let (Some(expected), Some(actual)) = (argument_fields.arity(), declared.arity()) {
                if expected != actual {
                    return Err(FieldsError::ArityMismatch {
                        context: "REPLACE requires the declared fields to match the arguments".to_string(),
                        expected,
                        actual,
                    });
                }
            }
            (incoming.clone(), OutputSelector::Replace(selector.clone()))
        }
        FieldsKind::Swap => {
            let retained: Vec<usize> = match &selector {
                Selector::All => Vec::new(),
                Selector::Positions(positions) => {
                    if !incoming.is_defined() {
                        return Err(FieldsError::Unresolvable {
                            kind: FieldsKind::Unknown,
                            usage: "a SWAP input".to_string(),
                        });
                    }
                    (0..incoming.size()).filter(|i| !positions.contains(i)).collect()
                }
            };
            let kept = match &selector {
                Selector::All => Fields::none(),
                Selector::Positions(positions) => incoming.subtract(positions),
            };
            (kept.append(&declared)?, OutputSelector::Swap { retained })
        }
        FieldsKind::Defined => {
            let (positions, outgoing) = select_over(incoming, &declared, output)?;
            (outgoing, OutputSelector::Select(positions))
        }
        kind => {
            return Err(FieldsError::Unresolvable {
                kind,
                usage: "an output selector".to_string(),
            })
        }
    };

    Ok(EachResolution {
        arguments: selector,
        argument_fields,
        declared,
        outgoing,
        output,
    })
}

/// Resolve an `Every` against the grouped member fields (`values`) and the
/// fields of whatever precedes it in the aggregation chain (`previous`).
pub fn resolve_every(
    values: &Fields,
    previous: &Fields,
    arguments: &Fields,
    declared: &Fields,
    output: &Fields,
) -> Result<EveryResolution, FieldsError> {
    let selector = arguments.positions_in(values)?;
    let argument_fields = arguments.select_from(values)?;
    let declared = substitute_declared(declared, &argument_fields)?;

    let (outgoing, output) = match output.kind() {
        FieldsKind::All => (previous.append(&declared)?, OutputSelector::Append),
        FieldsKind::Results => (declared.clone(), OutputSelector::Results),
        FieldsKind::Defined => {
            let (positions, outgoing) = select_over(previous, &declared, output)?;
            (outgoing, OutputSelector::Select(positions))
        }
        kind => {
            return Err(FieldsError::Unresolvable {
                kind,
                usage: "an aggregation output selector".to_string(),
            })
        }
    };

    Ok(EveryResolution {
        arguments: selector,
        argument_fields,
        declared,
        previous: previous.clone(),
        outgoing,
        output,
    })
}
