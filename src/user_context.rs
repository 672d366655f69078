use crate::{AttributeValue, UserAttributes};

/// Reserved attribute that overrides the user id for bucketing.
pub(crate) const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";

/// The user decisions are made for.
///
/// Create with [`Client::create_user_context`](crate::Client::create_user_context) or
/// [`UserContext::new`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserContext {
    user_id: String,
    attributes: UserAttributes,
    qualified_segments: Option<Vec<String>>,
}

impl UserContext {
    #[allow(missing_docs)]
    pub fn new(user_id: impl Into<String>, attributes: UserAttributes) -> UserContext {
        UserContext {
            user_id: user_id.into(),
            attributes,
            qualified_segments: None,
        }
    }

    #[allow(missing_docs)]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[allow(missing_docs)]
    pub fn attributes(&self) -> &UserAttributes {
        &self.attributes
    }

    /// Set or replace a single attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// ODP segments the user qualifies for. `None` if they were never fetched.
    pub fn qualified_segments(&self) -> Option<&[String]> {
        self.qualified_segments.as_deref()
    }

    #[allow(missing_docs)]
    pub fn set_qualified_segments(&mut self, segments: Option<Vec<String>>) {
        self.qualified_segments = segments;
    }

    /// Returns `true` if `segment` is one of the fetched qualified segments.
    pub fn is_qualified_for(&self, segment: &str) -> bool {
        self.qualified_segments
            .as_deref()
            .is_some_and(|segments| segments.iter().any(|it| it == segment))
    }

    /// Id used for hashing: `$opt_bucketing_id` if set to a string, the user id otherwise.
    pub(crate) fn bucketing_id(&self) -> &str {
        match self.attributes.get(BUCKETING_ID_ATTRIBUTE) {
            Some(AttributeValue::String(bucketing_id)) => bucketing_id,
            Some(_) => {
                log::warn!(target: "optimizely", user_id:display = self.user_id;
                           "bucketing id attribute is not a string, using user id");
                &self.user_id
            }
            None => &self.user_id,
        }
    }
}
