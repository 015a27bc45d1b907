use crate::postgres::ChangeEvent;
use crate::Result;

pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(event: &ChangeEvent) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }
}
