use std::io::Write;

use xml::writer::XmlEvent;
use xml::EventWriter;

use crate::error::EpubError;

pub fn write_elements(
    writer: &mut EventWriter<&mut (impl Write + Sized)>,
    elements: Vec<XmlEvent>,
) -> Result<(), EpubError> {
    for element in elements {
        writer.write(element)?;
    }
    Ok(())
}
