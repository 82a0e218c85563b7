mod driver;

pub use driver::{
    EmitFormat, PrependOutcome, load_module, output_path, prepend_file, render_module,
    write_output, write_report,
};
