//! Transform descriptors and their validated configuration.
//!
//! The descriptor is the payload the orchestrator ships with a transform:
//! stringly-typed, serializable, and unchecked. It is parsed exactly once
//! into a [`TransformConfig`]; anything malformed is a configuration error
//! and fatal at construction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::state::SideInputSpec;
use crate::time::TimeDomain;
use crate::timers::TimerFamilySpec;
use crate::window::{Window, WindowingStrategy};

/// URNs naming transform modes, materializations, and metrics.
pub mod urns {
    /// Plain per-element processing.
    pub const PAR_DO: &str = "spool:transform:pardo:v1";
    /// Pair each element with its initial restriction and estimator state.
    pub const PAIR_WITH_RESTRICTION: &str = "spool:transform:sdf_pair_with_restriction:v1";
    /// Split a paired restriction into sub-restrictions.
    pub const SPLIT_RESTRICTION: &str = "spool:transform:sdf_split_restriction:v1";
    /// Split a paired restriction into sized sub-restrictions.
    pub const SPLIT_AND_SIZE_RESTRICTIONS: &str = "spool:transform:sdf_split_and_size_restrictions:v1";
    /// Process paired elements with self-split support.
    pub const PROCESS_ELEMENTS: &str = "spool:transform:sdf_process_elements:v1";
    /// Process sized paired elements with self-split support.
    pub const PROCESS_SIZED_ELEMENTS_AND_RESTRICTIONS: &str =
        "spool:transform:sdf_process_sized_element_and_restrictions:v1";

    /// The only supported side-input materialization.
    pub const MULTIMAP_SIDE_INPUT: &str = "spool:side_input:multimap:v1";

    /// Progress metric: work completed within the current element.
    pub const WORK_COMPLETED: &str = "spool:metric:work_completed:v1";
    /// Progress metric: work remaining within the current element.
    pub const WORK_REMAINING: &str = "spool:metric:work_remaining:v1";
}

/// The execution mode selected by a transform's URN.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UrnMode {
    /// Invoke the process callback per element.
    ParDo,
    /// Pair each element with its initial restriction.
    PairWithRestriction,
    /// Split incoming restrictions into sub-restrictions.
    SplitRestriction {
        /// Whether each sub-restriction is emitted with its size.
        sized: bool,
    },
    /// Process restricted elements, exposing mid-element self-split.
    ProcessElements {
        /// Whether inputs and split artifacts carry sizes.
        sized: bool,
    },
}

impl UrnMode {
    /// Parses a URN string, if it names a known mode.
    pub fn from_urn(urn: &str) -> Option<Self> {
        match urn {
            urns::PAR_DO => Some(UrnMode::ParDo),
            urns::PAIR_WITH_RESTRICTION => Some(UrnMode::PairWithRestriction),
            urns::SPLIT_RESTRICTION => Some(UrnMode::SplitRestriction { sized: false }),
            urns::SPLIT_AND_SIZE_RESTRICTIONS => Some(UrnMode::SplitRestriction { sized: true }),
            urns::PROCESS_ELEMENTS => Some(UrnMode::ProcessElements { sized: false }),
            urns::PROCESS_SIZED_ELEMENTS_AND_RESTRICTIONS => {
                Some(UrnMode::ProcessElements { sized: true })
            }
            _ => None,
        }
    }

    /// The URN naming this mode.
    pub fn urn(&self) -> &'static str {
        match *self {
            UrnMode::ParDo => urns::PAR_DO,
            UrnMode::PairWithRestriction => urns::PAIR_WITH_RESTRICTION,
            UrnMode::SplitRestriction { sized: false } => urns::SPLIT_RESTRICTION,
            UrnMode::SplitRestriction { sized: true } => urns::SPLIT_AND_SIZE_RESTRICTIONS,
            UrnMode::ProcessElements { sized: false } => urns::PROCESS_ELEMENTS,
            UrnMode::ProcessElements { sized: true } => {
                urns::PROCESS_SIZED_ELEMENTS_AND_RESTRICTIONS
            }
        }
    }

    /// True for the two modes that run the split-critical protocol.
    pub fn is_splittable_process(&self) -> bool {
        matches!(self, UrnMode::ProcessElements { .. })
    }
}

/// The transform payload as shipped by the orchestrator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransformDescriptor {
    /// Unique id of the transform within the pipeline.
    pub transform_id: String,
    /// URN naming the execution mode.
    pub urn: String,
    /// Tag of the main input.
    pub main_input: String,
    /// Output tags, main output first.
    pub outputs: Vec<String>,
    /// Side input declarations.
    #[serde(default)]
    pub side_inputs: Vec<SideInputDescriptor>,
    /// Timer family declarations.
    #[serde(default)]
    pub timer_families: Vec<TimerFamilyDescriptor>,
    /// Windowing strategy of the main input.
    #[serde(default)]
    pub windowing: WindowingStrategy,
}

/// A declared side input.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SideInputDescriptor {
    /// The tag user code reads the view under.
    pub tag: String,
    /// URN of the materialization.
    pub materialization: String,
}

/// A declared timer family.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TimerFamilyDescriptor {
    /// The family's local name.
    pub family: String,
    /// The clock the family fires against.
    pub domain: TimeDomain,
}

/// A validated transform configuration.
#[derive(Debug)]
pub struct TransformConfig {
    /// Unique id of the transform within the pipeline.
    pub transform_id: String,
    /// The execution mode.
    pub mode: UrnMode,
    /// Tag of the main input.
    pub main_input: String,
    /// Output tags, main output first.
    pub outputs: Vec<String>,
    /// Side input specs by tag.
    pub side_inputs: HashMap<String, SideInputSpec>,
    /// Timer family specs by local name, iterated in name order.
    pub timer_families: BTreeMap<String, TimerFamilySpec>,
    /// Windowing strategy of the main input.
    pub windowing: WindowingStrategy,
}

impl TransformConfig {
    /// Parses and validates a descriptor.
    pub fn from_descriptor(descriptor: TransformDescriptor) -> Result<Self, Error> {
        let mode = UrnMode::from_urn(&descriptor.urn)
            .ok_or_else(|| Error::Config(format!("unknown transform urn {:?}", descriptor.urn)))?;

        if descriptor.main_input.is_empty() {
            return Err(Error::Config(format!(
                "transform {} declares no main input",
                descriptor.transform_id
            )));
        }
        if descriptor.outputs.is_empty() {
            return Err(Error::Config(format!(
                "transform {} declares no outputs",
                descriptor.transform_id
            )));
        }
        if matches!(mode, UrnMode::PairWithRestriction | UrnMode::SplitRestriction { .. })
            && descriptor.outputs.len() != 1
        {
            return Err(Error::Config(format!(
                "transform {} must have exactly one output for urn {}",
                descriptor.transform_id,
                mode.urn()
            )));
        }

        let mut side_inputs = HashMap::new();
        for side in descriptor.side_inputs {
            if side.materialization != urns::MULTIMAP_SIDE_INPUT {
                return Err(Error::Config(format!(
                    "side input {:?} uses unsupported materialization {:?}",
                    side.tag, side.materialization
                )));
            }
            side_inputs.insert(side.tag, SideInputSpec::multimap());
        }

        let mut timer_families = BTreeMap::new();
        for family in descriptor.timer_families {
            if family.family.is_empty() {
                return Err(Error::Config(format!(
                    "transform {} declares an unnamed timer family",
                    descriptor.transform_id
                )));
            }
            timer_families.insert(family.family, TimerFamilySpec { domain: family.domain });
        }
        if mode.is_splittable_process() && !timer_families.is_empty() {
            return Err(Error::Config(format!(
                "transform {} is splittable and cannot declare timer families",
                descriptor.transform_id
            )));
        }

        Ok(TransformConfig {
            transform_id: descriptor.transform_id,
            mode,
            main_input: descriptor.main_input,
            outputs: descriptor.outputs,
            side_inputs,
            timer_families,
            windowing: descriptor.windowing,
        })
    }

    /// Replaces the window-mapping function of a declared side input.
    pub fn with_side_input_mapping<F>(mut self, tag: &str, mapping: F) -> Result<Self, Error>
    where
        F: Fn(&Window) -> Window + 'static,
    {
        match self.side_inputs.get_mut(tag) {
            Some(spec) => {
                spec.set_window_mapping(mapping);
                Ok(self)
            }
            None => Err(Error::Config(format!("unknown side input tag {:?}", tag))),
        }
    }

    /// The main output tag.
    pub fn main_output(&self) -> &str {
        &self.outputs[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(urn: &str) -> TransformDescriptor {
        TransformDescriptor {
            transform_id: "t1".into(),
            urn: urn.into(),
            main_input: "in".into(),
            outputs: vec!["out".into()],
            side_inputs: Vec::new(),
            timer_families: Vec::new(),
            windowing: WindowingStrategy::default(),
        }
    }

    #[test]
    fn urns_round_trip_through_modes() {
        for urn in [
            urns::PAR_DO,
            urns::PAIR_WITH_RESTRICTION,
            urns::SPLIT_RESTRICTION,
            urns::SPLIT_AND_SIZE_RESTRICTIONS,
            urns::PROCESS_ELEMENTS,
            urns::PROCESS_SIZED_ELEMENTS_AND_RESTRICTIONS,
        ] {
            assert_eq!(UrnMode::from_urn(urn).unwrap().urn(), urn);
        }
        assert!(UrnMode::from_urn("spool:transform:unknown:v1").is_none());
    }

    #[test]
    fn unknown_urn_is_fatal() {
        let err = TransformConfig::from_descriptor(descriptor("nope")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn non_multimap_side_inputs_are_rejected() {
        let mut desc = descriptor(urns::PAR_DO);
        desc.side_inputs.push(SideInputDescriptor {
            tag: "side".into(),
            materialization: "spool:side_input:iterable:v1".into(),
        });
        assert!(matches!(
            TransformConfig::from_descriptor(desc),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn splittable_transforms_cannot_declare_timer_families() {
        let mut desc = descriptor(urns::PROCESS_ELEMENTS);
        desc.timer_families.push(TimerFamilyDescriptor {
            family: "retry".into(),
            domain: TimeDomain::ProcessingTime,
        });
        assert!(matches!(
            TransformConfig::from_descriptor(desc),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn pairing_requires_a_sole_output() {
        let mut desc = descriptor(urns::PAIR_WITH_RESTRICTION);
        desc.outputs.push("extra".into());
        assert!(matches!(
            TransformConfig::from_descriptor(desc),
            Err(Error::Config(_))
        ));
    }
}
