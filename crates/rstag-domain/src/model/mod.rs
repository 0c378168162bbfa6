//! Service-tags payload model.

mod def_helper;
mod delta;
mod types;

pub use def_helper::ServiceDefHelper;
pub use delta::apply_delta;
pub use types::{
    PolicyResource, PolicyType, ResourceDef, ServiceDef, ServiceResource, ServiceTags, Tag,
    TagsChangeExtent, ValidityPeriod,
};
