use cardbridge::{CardBridge, CardService};

/// Pick the reader to use
///
/// A named reader must exist. Otherwise the first reader holding a card is
/// used, falling back to the first reader when `need_card` is false.
pub fn select<S: CardService>(
    bridge: &CardBridge<S>,
    name: Option<&str>,
    need_card: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let readers = bridge.readers()?;

    if let Some(name) = name {
        return readers
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.name().to_string())
            .ok_or_else(|| format!("Reader '{}' not found", name).into());
    }

    if readers.is_empty() {
        return Err("No readers found!".into());
    }

    match readers.iter().find(|r| r.has_card()) {
        Some(reader) => Ok(reader.name().to_string()),
        None if need_card => Err("No card found in any reader!".into()),
        None => Ok(readers[0].name().to_string()),
    }
}
