use kdam::{BarExt, tqdm};
use mp4cenc::{DecryptingProcessor, ProgressFn};
use std::{env, process};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let (Some(input), Some(output)) = (args.next(), args.next()) else {
        eprintln!("usage: decrypt <input.mp4> <output.mp4> <kid:key>...");
        process::exit(2);
    };

    let mut builder = DecryptingProcessor::builder();

    for pair in args {
        let (kid, key) = pair
            .split_once(':')
            .ok_or("keys are given as <kid:key> pairs")?;
        builder = builder.key(kid, key)?;
    }

    let processor = builder.build()?;

    let mut pb = tqdm!(unit = " samples", force_refresh = true);
    let written = processor.decrypt_file_with_progress(
        &input,
        &output,
        &mut ProgressFn(|step, total| {
            pb.total = total as usize;
            let _ = pb.update_to(step as usize);
        }),
    )?;

    eprintln!();
    println!("{written} bytes written to {output}");
    Ok(())
}
