use crate::parser;

/// The property parameters the engine looks at.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    /// Purpose: To specify the identifier for the time zone definition for a
    /// time component in the property value.
    ///
    /// The value of the "TZID" property parameter will be equal to the value
    /// of the "TZID" property for the matching time zone definition. The
    /// presence of the SOLIDUS character as a prefix indicates that this
    /// "TZID" represents a unique ID in a globally defined time zone registry.
    TimeZoneID(String),

    /// Purpose: To explicitly specify the value type format for a property
    /// value, e.g. `VALUE=DATE` or `VALUE=PERIOD`.
    ValueDataType(String),

    /// Any parameter that wasn't recognized.
    Other { name: String, values: Vec<String> },
}

impl From<parser::Parameter> for Parameter {
    fn from(p: parser::Parameter) -> Self {
        let name = p.name.to_ascii_uppercase();
        // The grammar guarantees at least one value.
        let last = p.values.last().cloned().unwrap_or_default();

        match &name as &str {
            "TZID" => Parameter::TimeZoneID(last),
            "VALUE" => Parameter::ValueDataType(last),
            _ => Parameter::Other {
                name,
                values: p.values,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
}

impl<I> From<I> for ParameterSet
where
    I: IntoIterator<Item = parser::Parameter>,
{
    fn from(iter: I) -> Self {
        ParameterSet {
            parameters: iter.into_iter().map(Parameter::from).collect(),
        }
    }
}

impl ParameterSet {
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn get_value_data_type(&self) -> Option<&str> {
        self.parameters.iter().find_map(|param| match param {
            Parameter::ValueDataType(data_type) => Some(data_type as &str),
            _ => None,
        })
    }

    pub fn get_tzid(&self) -> Option<&str> {
        self.parameters.iter().find_map(|param| match param {
            Parameter::TimeZoneID(tzid) => Some(tzid as &str),
            _ => None,
        })
    }
}
